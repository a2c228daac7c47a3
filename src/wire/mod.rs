pub mod envelope;
pub mod framing;
