//! Scenario: delivery into a suspended epoch is buffered (the epoch
//! cannot terminate), then replayed on release.

use std::cell::Cell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

use plenum_test::{init_logger, Cluster};

use plenum::{ByteReader, ByteWriter, Envelope, NodeId, Runtime, RuntimeConfig, SchedulerEvent, Wire, WireErr};

static RELEASED: AtomicBool = AtomicBool::new(false);
static DELIVERED: AtomicBool = AtomicBool::new(false);

struct PingMsg;

impl Wire for PingMsg {
    fn ser(&self, _writer: &mut ByteWriter) {}

    fn de(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(PingMsg)
    }
}

fn on_ping(_rt: &mut Runtime, _envelope: &Envelope, _msg: PingMsg) {
    // the suspended epoch may not deliver before its release
    assert!(RELEASED.load(Ordering::SeqCst));
    DELIVERED.store(true, Ordering::SeqCst);
}

#[test]
fn suspended_epoch_buffers_until_release() {
    init_logger();
    Cluster::run(2, RuntimeConfig::default(), |rt| {
        let ping = rt.register_handler::<PingMsg>("test.ping", on_ping);
        rt.start();

        rt.run_in_epoch_collective("release-test", move |rt| {
            let epoch = rt.current_epoch();
            if rt.node() == NodeId(1) {
                rt.suspend_epoch(epoch);
                // release after the scheduler has idled a few times, by
                // which point the ping is normally already parked
                let idles = Rc::new(Cell::new(0u32));
                let fired = Rc::new(Cell::new(false));
                rt.register_trigger(SchedulerEvent::BeginIdle, move |rt| {
                    idles.set(idles.get() + 1);
                    if idles.get() >= 16 && !fired.get() {
                        fired.set(true);
                        RELEASED.store(true, Ordering::SeqCst);
                        rt.release_epoch(epoch);
                    }
                });
            }
            if rt.node() == NodeId(0) {
                rt.send_msg(NodeId(1), ping, &PingMsg);
            }
        });

        // termination implies the buffered message was replayed
        assert!(DELIVERED.load(Ordering::SeqCst));
        rt.finalize();
    });
}
