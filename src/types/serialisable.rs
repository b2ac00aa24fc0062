/// Types implementing BeanstalkSerialisable can be written onto the
/// client -> server half of a Beanstalk TCP connection.
pub trait BeanstalkSerialisable {
    /// Converts the value in question to its on-the-wire form, including any
    /// trailing payload block.
    fn serialise_beanstalk(&self) -> Vec<u8>;
}
