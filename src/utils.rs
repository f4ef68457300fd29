pub mod datetime;
pub mod random;
