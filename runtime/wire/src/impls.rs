use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;

use crate::{ByteReader, ByteWriter, FixedWire, Wire, WireErr};

pub(crate) fn read_u64(reader: &mut ByteReader) -> Result<u64, WireErr> {
    let bytes = reader.read_bytes(8)?;
    let mut array = [0u8; 8];
    array.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(array))
}

macro_rules! impl_wire_number {
    ($ty:ty, $bytes:expr) => {
        impl Wire for $ty {
            fn ser(&self, writer: &mut ByteWriter) {
                writer.write_bytes(&self.to_le_bytes());
            }

            fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
                let bytes = reader.read_bytes($bytes)?;
                let mut array = [0u8; $bytes];
                array.copy_from_slice(bytes);
                Ok(<$ty>::from_le_bytes(array))
            }
        }

        impl FixedWire for $ty {
            const BYTES: usize = $bytes;
        }
    };
}

impl_wire_number!(u8, 1);
impl_wire_number!(u16, 2);
impl_wire_number!(u32, 4);
impl_wire_number!(u64, 8);
impl_wire_number!(i8, 1);
impl_wire_number!(i16, 2);
impl_wire_number!(i32, 4);
impl_wire_number!(i64, 8);
impl_wire_number!(f32, 4);
impl_wire_number!(f64, 8);

impl Wire for bool {
    fn ser(&self, writer: &mut ByteWriter) {
        writer.write_byte(*self as u8);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "bool",
            }),
        }
    }
}

impl Wire for () {
    fn ser(&self, _writer: &mut ByteWriter) {}

    fn de(_reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok(())
    }
}

impl FixedWire for () {
    const BYTES: usize = 0;
}

impl Wire for String {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        writer.write_bytes(self.as_bytes());
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let bytes = reader.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireErr::BadUtf8)
    }
}

impl<T: Wire> Wire for Option<T> {
    fn ser(&self, writer: &mut ByteWriter) {
        match self {
            None => writer.write_byte(0),
            Some(value) => {
                writer.write_byte(1);
                value.ser(writer);
            }
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        match reader.read_byte()? {
            0 => Ok(None),
            1 => Ok(Some(T::de(reader)?)),
            value => Err(WireErr::BadDiscriminant {
                value: value as u64,
                type_name: "Option",
            }),
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        for item in self {
            item.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let mut items = Vec::with_capacity(len.min(reader.remaining().max(1)));
        for _ in 0..len {
            items.push(T::de(reader)?);
        }
        Ok(items)
    }
}

impl<K: Wire + Eq + Hash, V: Wire> Wire for HashMap<K, V> {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        for (key, value) in self {
            key.ser(writer);
            value.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let mut map = HashMap::new();
        for _ in 0..len {
            let key = K::de(reader)?;
            let value = V::de(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<K: Wire + Ord, V: Wire> Wire for BTreeMap<K, V> {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        for (key, value) in self {
            key.ser(writer);
            value.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let mut map = BTreeMap::new();
        for _ in 0..len {
            let key = K::de(reader)?;
            let value = V::de(reader)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

impl<T: Wire + Eq + Hash> Wire for HashSet<T> {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        for item in self {
            item.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let mut set = HashSet::new();
        for _ in 0..len {
            set.insert(T::de(reader)?);
        }
        Ok(set)
    }
}

impl<T: Wire + Ord> Wire for BTreeSet<T> {
    fn ser(&self, writer: &mut ByteWriter) {
        (self.len() as u64).ser(writer);
        for item in self {
            item.ser(writer);
        }
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        let len = reader.read_len()?;
        let mut set = BTreeSet::new();
        for _ in 0..len {
            set.insert(T::de(reader)?);
        }
        Ok(set)
    }
}

impl<A: Wire, B: Wire> Wire for (A, B) {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
        self.1.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok((A::de(reader)?, B::de(reader)?))
    }
}

impl<A: Wire, B: Wire, C: Wire> Wire for (A, B, C) {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
        self.1.ser(writer);
        self.2.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok((A::de(reader)?, B::de(reader)?, C::de(reader)?))
    }
}

impl<A: Wire, B: Wire, C: Wire, D: Wire> Wire for (A, B, C, D) {
    fn ser(&self, writer: &mut ByteWriter) {
        self.0.ser(writer);
        self.1.ser(writer);
        self.2.ser(writer);
        self.3.ser(writer);
    }

    fn de(reader: &mut ByteReader) -> Result<Self, WireErr> {
        Ok((A::de(reader)?, B::de(reader)?, C::de(reader)?, D::de(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{from_bytes, to_bytes};

    #[test]
    fn numbers_round_trip() {
        assert_eq!(from_bytes::<u64>(&to_bytes(&0xDEAD_BEEF_u64)).unwrap(), 0xDEAD_BEEF);
        assert_eq!(from_bytes::<i32>(&to_bytes(&-42_i32)).unwrap(), -42);
        assert_eq!(from_bytes::<f64>(&to_bytes(&3.5_f64)).unwrap(), 3.5);
    }

    #[test]
    fn exhausted_buffer_is_an_error() {
        let bytes = to_bytes(&7_u16);
        let result = from_bytes::<u64>(&bytes);
        assert!(matches!(result, Err(WireErr::Exhausted { .. })));
    }

    #[test]
    fn trailing_bytes_are_an_error() {
        let bytes = to_bytes(&7_u64);
        let result = from_bytes::<u16>(&bytes);
        assert!(matches!(result, Err(WireErr::TrailingBytes { remaining: 6 })));
    }

    #[test]
    fn corrupt_length_prefix_is_rejected() {
        let mut writer = ByteWriter::new();
        u64::MAX.ser(&mut writer);
        let bytes = writer.into_bytes();
        let result = from_bytes::<Vec<u8>>(&bytes);
        assert!(matches!(result, Err(WireErr::BadLength { .. })));
    }

    #[test]
    fn bad_bool_discriminant() {
        let result = from_bytes::<bool>(&[3]);
        assert!(matches!(
            result,
            Err(WireErr::BadDiscriminant { value: 3, type_name: "bool" })
        ));
    }

    #[test]
    fn containers_round_trip() {
        let mut map = BTreeMap::new();
        map.insert(1_u32, "one".to_string());
        map.insert(2_u32, "two".to_string());
        assert_eq!(from_bytes::<BTreeMap<u32, String>>(&to_bytes(&map)).unwrap(), map);

        let items = vec![(1_u64, 2.0_f64), (3_u64, 4.0_f64)];
        assert_eq!(from_bytes::<Vec<(u64, f64)>>(&to_bytes(&items)).unwrap(), items);

        assert_eq!(from_bytes::<Option<u8>>(&to_bytes(&Some(9_u8))).unwrap(), Some(9));
        assert_eq!(from_bytes::<Option<u8>>(&to_bytes(&None::<u8>)).unwrap(), None);
    }
}
