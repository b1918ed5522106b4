mod byte_cursor;
pub(crate) mod bytes;
pub(crate) mod time;
pub(crate) mod utf16;

pub(crate) use self::byte_cursor::ByteCursor;

pub(crate) type FastMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;
