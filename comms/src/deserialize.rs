use std::io;

/// Reads a message out of a received frame, borrowing from it when possible.
pub trait Deserialize<'a>: Sized {
    fn deserialize(buf: &'a [u8]) -> io::Result<Self>;
}
