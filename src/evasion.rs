use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use rand::Rng;

pub const URI_ENCODE_MODES: &[&str] = &[
    "hex-normal",
    "hex-all",
    "hex-random",
    "hex-noslashes",
    "u-normal",
    "u-random",
    "u-all",
];

/// How (and how aggressively) the request URI is percent-encoded. The
/// `u-*` modes emit the nonstandard `%uXXXX` form that several legacy
/// servers decode but many inspection layers do not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UriEncodeMode {
    HexNormal,
    HexAll,
    HexRandom,
    HexNoSlashes,
    UNormal,
    URandom,
    UAll,
}

impl UriEncodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UriEncodeMode::HexNormal => "hex-normal",
            UriEncodeMode::HexAll => "hex-all",
            UriEncodeMode::HexRandom => "hex-random",
            UriEncodeMode::HexNoSlashes => "hex-noslashes",
            UriEncodeMode::UNormal => "u-normal",
            UriEncodeMode::URandom => "u-random",
            UriEncodeMode::UAll => "u-all",
        }
    }
}

impl FromStr for UriEncodeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hex-normal" => Ok(UriEncodeMode::HexNormal),
            "hex-all" => Ok(UriEncodeMode::HexAll),
            "hex-random" => Ok(UriEncodeMode::HexRandom),
            "hex-noslashes" => Ok(UriEncodeMode::HexNoSlashes),
            "u-normal" => Ok(UriEncodeMode::UNormal),
            "u-random" => Ok(UriEncodeMode::URandom),
            "u-all" => Ok(UriEncodeMode::UAll),
            _ => Err(format!("unknown uri encode mode: {s}")),
        }
    }
}

impl fmt::Display for UriEncodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const PAD_TYPES: &[&str] = &["space", "tab", "apache"];

/// Character class used to pad the request line. `Apache` draws a mixed
/// run of SP and HT, both of which Apache's line parser tolerates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PadType {
    Space,
    Tab,
    Apache,
}

impl FromStr for PadType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "space" => Ok(PadType::Space),
            "tab" => Ok(PadType::Tab),
            "apache" => Ok(PadType::Apache),
            _ => Err(format!("unknown pad type: {s}")),
        }
    }
}

pub fn pad(kind: PadType, count: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| match kind {
            PadType::Space => ' ',
            PadType::Tab => '\t',
            PadType::Apache => {
                if rng.gen_bool(0.5) {
                    ' '
                } else {
                    '\t'
                }
            }
        })
        .collect()
}

// '%' is preserved so already-escaped input survives the normal modes;
// the *-all modes still re-encode it for deliberate double encoding
fn needs_hex(b: u8) -> bool {
    !(b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~' | b'/' | b'%'))
}

fn push_hex(out: &mut String, b: u8) {
    out.push_str(&format!("%{:02x}", b));
}

fn push_u(out: &mut String, b: u8) {
    out.push_str(&format!("%u00{:02x}", b));
}

fn encode_pass(input: &str, mode: UriEncodeMode) -> String {
    let mut rng = rand::thread_rng();
    let mut out = String::with_capacity(input.len() * 3);
    for &b in input.as_bytes() {
        match mode {
            UriEncodeMode::HexNormal => {
                if needs_hex(b) {
                    push_hex(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
            UriEncodeMode::HexAll => push_hex(&mut out, b),
            UriEncodeMode::HexNoSlashes => {
                if b == b'/' {
                    out.push('/');
                } else {
                    push_hex(&mut out, b);
                }
            }
            UriEncodeMode::HexRandom => {
                if needs_hex(b) || rng.gen_bool(0.5) {
                    push_hex(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
            UriEncodeMode::UNormal => {
                if needs_hex(b) {
                    push_u(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
            UriEncodeMode::UAll => push_u(&mut out, b),
            UriEncodeMode::URandom => {
                if needs_hex(b) || rng.gen_bool(0.5) {
                    push_u(&mut out, b);
                } else {
                    out.push(b as char);
                }
            }
        }
    }
    out
}

/// Encodes `input` once per `count`. Counts above one re-encode the
/// previous pass's output, producing the classic double/triple-encoding
/// evasions.
pub fn encode_uri(input: &str, mode: UriEncodeMode, count: usize) -> String {
    let mut out = input.to_string();
    for _ in 0..count.max(1) {
        out = encode_pass(&out, mode);
    }
    out
}

const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn rand_text_alpha(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| *ALPHA.choose(&mut rng).unwrap() as char)
        .collect()
}

pub fn rand_text_alphanumeric(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| *ALNUM.choose(&mut rng).unwrap() as char)
        .collect()
}

pub fn rand_text_alpha_range(lo: usize, hi: usize) -> String {
    let len = rand::thread_rng().gen_range(lo..=hi);
    rand_text_alpha(len)
}

const VALID_METHODS: &[&str] = &["GET", "POST", "HEAD"];

pub fn rand_valid_method() -> String {
    VALID_METHODS
        .choose(&mut rand::thread_rng())
        .unwrap()
        .to_string()
}

pub fn rand_invalid_method() -> String {
    rand_text_alpha_range(3, 10).to_ascii_uppercase()
}

pub fn rand_case(input: &str) -> String {
    let mut rng = rand::thread_rng();
    input
        .chars()
        .map(|c| {
            if rng.gen_bool(0.5) {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            }
        })
        .collect()
}

const HTTP_VERSIONS: &[&str] = &["1.0", "1.1"];

pub fn rand_valid_version() -> String {
    HTTP_VERSIONS
        .choose(&mut rand::thread_rng())
        .unwrap()
        .to_string()
}

pub fn rand_invalid_version() -> String {
    let mut rng = rand::thread_rng();
    format!("{}.{}", rng.gen_range(2u8..10), rng.gen_range(0u8..10))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_str() {
        for name in URI_ENCODE_MODES {
            let mode: UriEncodeMode = name.parse().unwrap();
            assert_eq!(mode.as_str(), *name);
        }
        assert!("hex-bogus".parse::<UriEncodeMode>().is_err());
    }

    #[test]
    fn hex_normal_keeps_slashes() {
        let out = encode_uri("/a b/c", UriEncodeMode::HexNormal, 1);
        assert_eq!(out, "/a%20b/c");
    }

    #[test]
    fn hex_all_encodes_everything() {
        let out = encode_uri("/ab", UriEncodeMode::HexAll, 1);
        assert_eq!(out, "%2f%61%62");
    }

    #[test]
    fn hex_noslashes_spares_only_slashes() {
        let out = encode_uri("/ab", UriEncodeMode::HexNoSlashes, 1);
        assert_eq!(out, "/%61%62");
    }

    #[test]
    fn u_normal_uses_unicode_form() {
        let out = encode_uri("a b", UriEncodeMode::UNormal, 1);
        assert_eq!(out, "a%u0020b");
    }

    #[test]
    fn count_double_encodes() {
        let out = encode_uri("a", UriEncodeMode::HexAll, 2);
        assert_eq!(out, "%25%36%31");
        // normal mode leaves existing escapes alone
        assert_eq!(encode_uri("/a%20b", UriEncodeMode::HexNormal, 1), "/a%20b");
    }

    #[test]
    fn padding_widths_and_charsets() {
        assert_eq!(pad(PadType::Space, 4), "    ");
        assert_eq!(pad(PadType::Tab, 2), "\t\t");
        let apache = pad(PadType::Apache, 64);
        assert_eq!(apache.len(), 64);
        assert!(apache.chars().all(|c| c == ' ' || c == '\t'));
    }

    #[test]
    fn random_tokens_have_requested_shape() {
        let m = rand_invalid_method();
        assert!((3..=10).contains(&m.len()));
        assert!(m.chars().all(|c| c.is_ascii_uppercase()));
        assert!(VALID_METHODS.contains(&rand_valid_method().as_str()));
        let ws = rand_text_alpha_range(6, 13);
        assert!((6..=13).contains(&ws.len()));
    }
}
