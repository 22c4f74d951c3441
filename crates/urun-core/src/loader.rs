//! Byte-level rewriting of string literals inside a dynamic loader.
//!
//! Offsets inside an ELF image must not move, so every replacement keeps
//! the original length and pads the tail with NUL bytes.

use urun_common::constants::LD_LIBRARY_REAL;
use urun_common::error::{Result, UrunError};

/// Path literals compiled into glibc's loader that make it search the
/// host's library directories.
pub const BLINDED_PATHS: [&str; 3] = ["/etc/ld.so", "/lib", "/usr"];

/// Environment variable name the loader reads the search path from.
pub const LD_LIBRARY_PATH: &str = "LD_LIBRARY_PATH";

/// Replaces every occurrence of `from` with `to`, padding with NUL up to
/// `from.len()`. Returns how many occurrences changed.
///
/// Occurrences are matched anywhere, so `/lib` inside `/lib64/` is blanked
/// too: the NUL written over the first byte ends the string there.
///
/// # Errors
///
/// Returns [`UrunError::Config`] when `to` is longer than `from` or
/// `from` is empty.
pub fn replace_padded(data: &mut [u8], from: &[u8], to: &[u8]) -> Result<usize> {
    if from.is_empty() || to.len() > from.len() {
        return Err(UrunError::Config {
            message: format!(
                "cannot replace {:?} with {:?} without shifting offsets",
                String::from_utf8_lossy(from),
                String::from_utf8_lossy(to)
            ),
        });
    }
    let mut count = 0;
    let mut i = 0;
    while i + from.len() <= data.len() {
        let end = i + from.len();
        if &data[i..end] == from {
            data[i..i + to.len()].copy_from_slice(to);
            data[i + to.len()..end].fill(0);
            count += 1;
            i = end;
        } else {
            i += 1;
        }
    }
    Ok(count)
}

/// Returns a copy of a loader image that ignores the host's library
/// locations and reads its search path from `LD_LIBRARY_REAL` instead of
/// `LD_LIBRARY_PATH`.
#[must_use]
pub fn blind_loader(image: &[u8]) -> Vec<u8> {
    let mut data = image.to_vec();
    for path in BLINDED_PATHS {
        // Lengths are fixed and `b""` is never longer than a literal.
        let n = replace_padded(&mut data, path.as_bytes(), b"").unwrap_or(0);
        tracing::trace!(literal = path, occurrences = n, "blanked loader path");
    }
    // Only the standalone literal; longer names that embed it stay intact.
    let n = replace_padded(
        &mut data,
        &nul_delimited(LD_LIBRARY_PATH),
        &nul_delimited(LD_LIBRARY_REAL),
    )
    .unwrap_or(0);
    tracing::trace!(occurrences = n, "renamed library path variable");
    data
}

fn nul_delimited(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 2);
    bytes.push(0);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replacement_keeps_length_and_pads() {
        let mut data = b"xx/usr\0yy".to_vec();
        let n = replace_padded(&mut data, b"/usr", b"/u").unwrap();
        assert_eq!(n, 1);
        assert_eq!(data, b"xx/u\0\0\0yy");
    }

    #[test]
    fn longer_replacement_is_rejected() {
        let mut data = b"/lib\0".to_vec();
        assert!(replace_padded(&mut data, b"/lib", b"/lib64").is_err());
        assert!(replace_padded(&mut data, b"", b"").is_err());
        assert_eq!(data, b"/lib\0");
    }

    #[test]
    fn every_occurrence_is_blanked() {
        let mut data = b"/lib64/\0/lib\0".to_vec();
        let n = replace_padded(&mut data, b"/lib", b"").unwrap();
        assert_eq!(n, 2);
        assert_eq!(data, b"\0\0\0\064/\0\0\0\0\0\0");
    }

    #[test]
    fn literal_at_buffer_end_is_replaced() {
        let mut data = b"ab/usr".to_vec();
        assert_eq!(replace_padded(&mut data, b"/usr", b"").unwrap(), 1);
        assert_eq!(data, b"ab\0\0\0\0");
    }

    #[test]
    fn blind_loader_rewrites_all_literals() {
        let mut image = Vec::new();
        image.extend_from_slice(b"\x7fELF\0");
        image.extend_from_slice(b"/etc/ld.so\0");
        image.extend_from_slice(b"/lib\0/usr\0");
        image.extend_from_slice(b"LD_LIBRARY_PATH\0tail");

        let out = blind_loader(&image);
        assert_eq!(out.len(), image.len());
        let text = String::from_utf8_lossy(&out);
        assert!(!text.contains("/etc/ld.so"));
        assert!(!text.contains("/usr"));
        assert!(text.contains("LD_LIBRARY_REAL"));
        assert!(!text.contains("LD_LIBRARY_PATH"));
        assert!(out.starts_with(b"\x7fELF\0"));
        assert!(out.ends_with(b"tail"));
    }

    #[test]
    fn embedded_variable_names_are_left_alone() {
        let image = b"\0XLD_LIBRARY_PATH_EXTRA\0GCONV_LD_LIBRARY_PATH\0LD_LIBRARY_PATH\0".to_vec();
        let out = blind_loader(&image);
        assert_eq!(
            out,
            b"\0XLD_LIBRARY_PATH_EXTRA\0GCONV_LD_LIBRARY_PATH\0LD_LIBRARY_REAL\0".to_vec()
        );
    }

    #[test]
    fn library_variable_names_have_equal_length() {
        assert_eq!(LD_LIBRARY_PATH.len(), LD_LIBRARY_REAL.len());
    }
}
