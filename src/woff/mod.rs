//! WOFF2 container parsing and table transforms

pub(crate) mod glyf_decoder;
pub mod headers;
pub(crate) mod hmtx_decoder;
