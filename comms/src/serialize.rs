use std::io;

/// Writes a message into an outgoing buffer.
pub trait Serialize<'a> {
    /// Serializes `self` into `buf`.
    ///
    /// # Arguments
    /// * `buf` - The buffer holding the bytes to send.
    ///
    /// # Returns
    /// Optionally a borrowed tail of bytes to be sent right after `buf` without copying.
    fn serialize(&'a self, buf: &mut Vec<u8>) -> io::Result<Option<&'a [u8]>>;
}
