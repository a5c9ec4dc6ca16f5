//! Header-level metadata: the Python-literal syntax, the `descr` grammar and
//! the preamble that wraps them.

pub mod descr;
pub mod header;
pub mod literal;

pub use descr::{descr_string, parse_descr, parse_typestr, typestr};
pub use header::{ALIGNMENT, ArrayHeader, FormatVersion, MAGIC};
