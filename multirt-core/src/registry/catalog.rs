//! Standard native extensions expected by a stock engine build.
//!
//! The host links these into one library (usually the host executable itself)
//! and exports an initializer per module as `<prefix><name>`.

use anyhow::Result;
use std::path::Path;

use super::NativeModuleRegistry;

/// Symbol prefix used by the stock engine build for module initializers.
pub const DEFAULT_SYMBOL_PREFIX: &str = "PyInit_";

pub const STANDARD_EXTENSIONS: &[&str] = &[
    "array",
    "_asyncio",
    "audioop",
    "binascii",
    "_bisect",
    "_blake2",
    "_bz2",
    "cmath",
    "_codecs_cn",
    "_codecs_hk",
    "_codecs_iso2022",
    "_codecs_jp",
    "_codecs_kr",
    "_codecs_tw",
    "_contextvars",
    "_crypt",
    "_csv",
    "_ctypes",
    "_ctypes_test",
    "_curses",
    "_curses_panel",
    "_datetime",
    "_decimal",
    "_elementtree",
    "fcntl",
    "grp",
    "_hashlib",
    "_heapq",
    "_json",
    "_lsprof",
    "_lzma",
    "math",
    "_md5",
    "mmap",
    "_multibytecodec",
    "_multiprocessing",
    "nis",
    "_opcode",
    "ossaudiodev",
    "parser",
    "_pickle",
    "_posixsubprocess",
    "pyexpat",
    "_queue",
    "_random",
    "readline",
    "resource",
    "select",
    "_sha1",
    "_sha256",
    "_sha3",
    "_sha512",
    "_socket",
    "spwd",
    "_ssl",
    "_struct",
    "syslog",
    "termios",
    "_testbuffer",
    "_testcapi",
    "_testimportmultiple",
    "_testmultiphase",
    "unicodedata",
    "xxlimited",
    "_xxtestfuzz",
    "zlib",
];

/// Bind every [`STANDARD_EXTENSIONS`] initializer exported by `library`.
pub fn register_standard_catalog(
    registry: &mut NativeModuleRegistry,
    library: &Path,
    symbol_prefix: &str,
) -> Result<usize> {
    registry.register_library(library, STANDARD_EXTENSIONS, symbol_prefix)
}
