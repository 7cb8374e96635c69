use font_types::Tag;
use thiserror::Error;

/// The reason a WOFF2 file could not be decoded.
///
/// The `Display` output of each variant is the short cause phrase used by the
/// WOFF2 conformance suite, prefixed by the offending table tag where one is
/// known (for example `loca: transformLength must be zero`).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum WuffErr {
    /// The fixed 48-byte header is invalid
    #[error("{0}")]
    Header(&'static str),
    /// The table directory or collection directory as a whole is invalid
    #[error("{0}")]
    Directory(&'static str),
    /// A single table directory entry is invalid
    #[error("{tag}: {reason}")]
    Table { tag: Tag, reason: &'static str },
    /// A table appears before a table it must follow
    #[error("{tag}: must come after {after} table")]
    Ordering { tag: Tag, after: Tag },
    /// The brotli stream could not be decoded
    #[error("brotli: corrupted input")]
    Brotli,
    /// The brotli stream decoded to the wrong number of bytes
    #[error("sum of table lengths must match decompressed font data size")]
    DecompressedLength { expected: usize },
    /// `glyf` and `loca` disagree about being present or transformed
    #[error(
        "glyf and loca tables must be both present and either be both transformed or untransformed"
    )]
    GlyfLocaMismatch,
    /// A transformed table is inconsistent with its transform definition
    #[error("{tag}: {reason}")]
    Transform { tag: Tag, reason: &'static str },
    /// A reconstructed value does not fit the field it must be stored in
    #[error("{tag}: {reason}")]
    Overflow { tag: Tag, reason: &'static str },
    /// The reconstructed tables violate an SFNT structural invariant
    #[error("{tag}: {reason}")]
    Layout { tag: Tag, reason: &'static str },
    /// The compressed data, metadata and private blocks are misplaced
    #[error("{0}")]
    Block(&'static str),
    /// Ran out of input while reading a fixed-size field
    #[error("unexpected end of data")]
    Truncated,
}

/// Coarse classification of a [`WuffErr`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Header,
    Directory,
    Ordering,
    Decompression,
    TransformConsistency,
    Overflow,
    Layout,
}

impl WuffErr {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WuffErr::Header(_) => ErrorKind::Header,
            WuffErr::Directory(_) | WuffErr::Table { .. } | WuffErr::Truncated => {
                ErrorKind::Directory
            }
            WuffErr::Block(_) => ErrorKind::Directory,
            WuffErr::Ordering { .. } => ErrorKind::Ordering,
            WuffErr::Brotli | WuffErr::DecompressedLength { .. } => ErrorKind::Decompression,
            WuffErr::GlyfLocaMismatch | WuffErr::Transform { .. } => {
                ErrorKind::TransformConsistency
            }
            WuffErr::Overflow { .. } => ErrorKind::Overflow,
            WuffErr::Layout { .. } => ErrorKind::Layout,
        }
    }

    pub(crate) fn table(tag: Tag, reason: &'static str) -> Self {
        WuffErr::Table { tag, reason }
    }

    pub(crate) fn transform(tag: Tag, reason: &'static str) -> Self {
        WuffErr::Transform { tag, reason }
    }

    pub(crate) fn overflow(tag: Tag, reason: &'static str) -> Self {
        WuffErr::Overflow { tag, reason }
    }

    pub(crate) fn layout(tag: Tag, reason: &'static str) -> Self {
        WuffErr::Layout { tag, reason }
    }
}

impl From<bytes::TryGetError> for WuffErr {
    fn from(_value: bytes::TryGetError) -> Self {
        Self::Truncated
    }
}

pub(crate) fn usize_will_overflow(a: usize, b: usize) -> bool {
    a.checked_add(b).is_none()
}

pub(crate) fn u32_will_overflow(a: u32, b: u32) -> bool {
    a.checked_add(b).is_none()
}

#[cfg(not(feature = "debug"))]
mod regular {
    macro_rules! bail {
        ($err: expr) => {{
            let err: $crate::error::WuffErr = $err;
            log::debug!("rejecting font: {err}");
            return Err(err);
        }};
    }
    pub(crate) use bail;

    macro_rules! bail_if {
        ($cond: expr, $err: expr) => {
            if $cond {
                $crate::error::bail!($err);
            }
        };
    }
    pub(crate) use bail_if;
}
#[cfg(not(feature = "debug"))]
pub(crate) use regular::*;

#[cfg(feature = "debug")]
mod debug {
    macro_rules! bail {
        ($err: expr) => {{
            let err: $crate::error::WuffErr = $err;
            panic!("{err}")
        }};
    }
    pub(crate) use bail;

    macro_rules! bail_if {
        ($cond: expr, $err: expr) => {
            if $cond {
                panic!("{} ({})", $err, stringify!($cond))
            }
        };
    }
    pub(crate) use bail_if;
}
#[cfg(feature = "debug")]
pub(crate) use debug::*;
