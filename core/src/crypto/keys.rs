/// Key derivation for the platform's message cipher.
///
/// A 16-byte salt (versioned prefix + sender id) is stretched into a 32-byte
/// AES key with a PKCS#12-style construction over SHA-1. The byte handling
/// here is deliberately exact: the UTF-16BE re-encoding of the application
/// secret, the 64-byte tiling and the big-endian carry adjustment all have to
/// match the platform client or decryption silently yields garbage.
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};

/// Fixed application secret baked into the platform client
const APP_SECRET: [u8; 16] = [22, 8, 9, 111, 2, 23, 43, 8, 33, 33, 10, 16, 3, 3, 7, 6];

const BLOCK_LEN: usize = 64;
const DIGEST_LEN: usize = 20;
const KEY_LEN: usize = 32;
/// Total SHA-1 applications per derived block (initial digest + one extra)
const STRETCH_ROUNDS: usize = 2;

const WORDS_A: [&str; 54] = [
    "adrp.ldrsh.ldnp", "ldpsw", "umax", "stnp.rsubhn", "sqdmlsl", "uqrshl.csel", "sqshlu",
    "umin.usubl.umlsl", "cbnz.adds", "tbnz",
    "usubl2", "stxr", "sbfx", "strh", "stxrb.adcs", "stxrh", "ands.urhadd", "subs", "sbcs",
    "fnmadd.ldxrb.saddl",
    "stur", "ldrsb", "strb", "prfm", "ubfiz", "ldrsw.madd.msub.sturb.ldursb", "ldrb", "b.eq",
    "ldur.sbfiz", "extr",
    "fmadd", "uqadd", "sshr.uzp1.sttrb", "umlsl2", "rsubhn2.ldrh.uqsub", "uqshl", "uabd",
    "ursra", "usubw", "uaddl2",
    "b.gt", "b.lt", "sqshl", "bics", "smin.ubfx", "smlsl2", "uabdl2", "zip2.ssubw2", "ccmp",
    "sqdmlal",
    "b.al", "smax.ldurh.uhsub", "fcvtxn2", "b.pl",
];

const WORDS_B: [&str; 57] = [
    "saddl", "urhadd", "ubfiz.sqdmlsl.tbnz.stnp", "smin", "strh", "ccmp", "usubl", "umlsl",
    "uzp1", "sbfx",
    "b.eq", "zip2.prfm.strb", "msub", "b.pl", "csel", "stxrh.ldxrb", "uqrshl.ldrh", "cbnz",
    "ursra", "sshr.ubfx.ldur.ldnp",
    "fcvtxn2", "usubl2", "uaddl2", "b.al", "ssubw2", "umax", "b.lt", "adrp.sturb", "extr",
    "uqshl",
    "smax", "uqsub.sqshlu", "ands", "madd", "umin", "b.gt", "uabdl2", "ldrsb.ldpsw.rsubhn",
    "uqadd", "sttrb",
    "stxr", "adds", "rsubhn2.umlsl2", "sbcs.fmadd", "usubw", "sqshl", "stur.ldrsh.smlsl2",
    "ldrsw", "fnmadd", "stxrb.sbfiz",
    "adcs", "bics.ldrb", "l1ursb", "subs.uhsub", "ldurh", "uabd", "sqdmlal",
];

/// Compose a prefix token from the two word lists, indexed by a large
/// constant modulo their lengths. The client obfuscates two dictionary
/// entries this way instead of storing them as literals.
fn compose_token(n: u64) -> String {
    let first = WORDS_A[(n % WORDS_A.len() as u64) as usize];
    let second = WORDS_B[((n + 31) % WORDS_B.len() as u64) as usize];
    format!("{}.{}", first, second)
}

/// Salt prefixes indexed by scheme version; computed once at startup.
/// Unknown versions fall back to the empty prefix.
static SALT_PREFIXES: Lazy<Vec<String>> = Lazy::new(|| {
    let mut prefixes: Vec<String> = [
        "", "", "12", "24", "18", "30", "36", "12", "48", "7", "35", "40", "17", "23", "29",
        "isabel", "kale", "sulli", "van", "merry", "kyle", "james", "maddux", "tony", "hayden",
        "paul", "elijah", "dorothy", "sally", "bran",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    prefixes.push(compose_token(830_819));
    prefixes.push("veil".to_string());
    prefixes
});

pub fn salt_prefix(scheme_version: u32) -> &'static str {
    SALT_PREFIXES
        .get(scheme_version as usize)
        .map(|s| s.as_str())
        .unwrap_or("")
}

/// Build the 16-byte salt: prefix + stringified user id, truncated to 16
/// characters and zero-padded to 16 bytes.
pub(crate) fn build_salt(user_id: &str, scheme_version: u32) -> [u8; 16] {
    let joined: String = format!("{}{}", salt_prefix(scheme_version), user_id)
        .chars()
        .take(16)
        .collect();
    let mut salt = [0u8; 16];
    let bytes = joined.as_bytes();
    let len = bytes.len().min(16);
    salt[..len].copy_from_slice(&bytes[..len]);
    salt
}

/// Application secret as null-terminated big-endian UTF-16: each byte becomes
/// a 0x00 high byte followed by the byte itself, after appending a NUL.
fn utf16be_password() -> Vec<u8> {
    let mut out = Vec::with_capacity((APP_SECRET.len() + 1) * 2);
    for &byte in APP_SECRET.iter().chain(std::iter::once(&0)) {
        out.push(0);
        out.push(byte);
    }
    out
}

/// Tile `src` to the next multiple of `boundary` bytes
fn tile(src: &[u8], boundary: usize) -> Vec<u8> {
    let len = ((src.len() + boundary - 1) / boundary) * boundary;
    (0..len).map(|i| src[i % src.len()]).collect()
}

/// Big-endian "add B, plus one, propagate carry" over one 64-byte segment
fn adjust(buf: &mut [u8], offset: usize, b: &[u8]) {
    let last = b.len() - 1;
    let mut x = (b[last] as u32) + (buf[offset + last] as u32) + 1;
    buf[offset + last] = (x & 0xff) as u8;
    x >>= 8;
    for i in (0..last).rev() {
        x += (b[i] as u32) + (buf[offset + i] as u32);
        buf[offset + i] = (x & 0xff) as u8;
        x >>= 8;
    }
}

fn stretch(salt: &[u8; 16]) -> [u8; KEY_LEN] {
    let password = utf16be_password();
    let diversifier = [1u8; BLOCK_LEN];

    let mut mixing = tile(salt, BLOCK_LEN);
    mixing.extend(tile(&password, BLOCK_LEN));

    let mut key = [0u8; KEY_LEN];
    let mut filled = 0;
    while filled < KEY_LEN {
        let mut hasher = Sha1::new();
        hasher.update(diversifier);
        hasher.update(&mixing);
        let mut block: [u8; DIGEST_LEN] = hasher.finalize().into();
        for _ in 1..STRETCH_ROUNDS {
            block = Sha1::digest(block).into();
        }

        let mut b = [0u8; BLOCK_LEN];
        for (i, slot) in b.iter_mut().enumerate() {
            *slot = block[i % DIGEST_LEN];
        }
        for segment in 0..mixing.len() / BLOCK_LEN {
            adjust(&mut mixing, segment * BLOCK_LEN, &b);
        }

        let take = (KEY_LEN - filled).min(DIGEST_LEN);
        key[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
    }
    key
}

/// Derive the 32-byte message key for a sender and scheme version.
/// Pure and deterministic; invalid versions degrade to the empty prefix.
pub fn derive_key(user_id: &str, scheme_version: u32) -> [u8; KEY_LEN] {
    stretch(&build_salt(user_id, scheme_version))
}
