// SPDX-License-Identifier: Apache-2.0

//! Little-endian encoding of the fixed-layout records a backend places on
//! the migration stream.

mod encoder;

mod decoder;

pub use decoder::Decoder;

pub use encoder::Encoder;
