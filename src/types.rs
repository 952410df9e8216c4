use std::cmp::Ordering;
use std::fmt::Debug;

/// Name recorded in the meta page for the key and value types of a tree
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TypeName(String);

impl TypeName {
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

pub trait Value: Debug + Sized {
    /// Width of the serialized form, if every value serializes to the same number of bytes
    fn fixed_width() -> Option<usize>;

    /// Deserializes data
    fn from_bytes(data: &[u8]) -> Self;

    /// Serialize the value to a byte vector
    fn as_bytes(&self) -> Vec<u8>;

    /// Globally unique identifier for this type
    fn type_name() -> TypeName;
}

pub trait Key: Value {
    /// Compare data1 with data2
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering;
}

impl Value for u64 {
    fn fixed_width() -> Option<usize> {
        Some(8)
    }

    fn from_bytes(data: &[u8]) -> Self {
        u64::from_be_bytes(data.try_into().unwrap())
    }

    fn as_bytes(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn type_name() -> TypeName {
        TypeName::new("u64")
    }
}

// Big-endian, so byte order is numeric order
impl Key for u64 {
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering {
        data1.cmp(data2)
    }
}

impl Value for Vec<u8> {
    fn fixed_width() -> Option<usize> {
        None
    }

    fn from_bytes(data: &[u8]) -> Self {
        data.to_vec()
    }

    fn as_bytes(&self) -> Vec<u8> {
        self.clone()
    }

    fn type_name() -> TypeName {
        TypeName::new("[u8]")
    }
}

impl Key for Vec<u8> {
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering {
        data1.cmp(data2)
    }
}

impl Value for String {
    fn fixed_width() -> Option<usize> {
        None
    }

    fn from_bytes(data: &[u8]) -> Self {
        String::from_utf8_lossy(data).into_owned()
    }

    fn as_bytes(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn type_name() -> TypeName {
        TypeName::new("&str")
    }
}

impl Key for String {
    fn compare(data1: &[u8], data2: &[u8]) -> Ordering {
        data1.cmp(data2)
    }
}
