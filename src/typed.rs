//! String and integer conveniences over the byte-oriented surface.
//!
//! Values are stored with a single trailing NUL so readers in other
//! languages can treat them as C strings; the typed getters strip it.
//! Formatted values are a `format!` away from [`ShmTable::put_str`].

use crate::error::Result;
use crate::table::ShmTable;

impl ShmTable<'_> {
    /// Store a UTF-8 string value.
    pub fn put_str(&mut self, key: &str, value: &str) -> Result<()> {
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        self.put(key.as_bytes(), &bytes)
    }

    /// Fetch a value stored by [`ShmTable::put_str`].
    pub fn get_str(&self, key: &str) -> Result<String> {
        let mut bytes = self.get(key.as_bytes())?;
        if bytes.last() == Some(&0) {
            bytes.pop();
        }
        Ok(String::from_utf8(bytes)?)
    }

    /// Store a signed integer as decimal text.
    pub fn put_int(&mut self, key: &str, value: i64) -> Result<()> {
        self.put_str(key, &value.to_string())
    }

    /// Fetch and parse a value stored by [`ShmTable::put_int`].
    pub fn get_int(&self, key: &str) -> Result<i64> {
        Ok(self.get_str(key)?.parse()?)
    }
}
