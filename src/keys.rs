//! Order-preserving tuple encoding for store keys and values.
//!
//! Comparing two encoded keys lexicographically yields the same order as
//! comparing the source tuples component-wise. Subspace prefixes are short
//! strings and form part of the persisted layout.

use std::fmt;

use crate::error::{Result, RoomservError};

const CODE_BYTES: u8 = 0x01;
const CODE_STRING: u8 = 0x02;
const CODE_INT_ZERO: u8 = 0x14;
const CODE_VERSIONSTAMP: u8 = 0x33;

const INCOMPLETE_TX: [u8; 10] = [0xff; 10];

/// 12-byte monotonic write position: 10 store-assigned bytes plus a 2-byte
/// caller-assigned user version ordering writes within one transaction.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Versionstamp {
    pub tx: [u8; 10],
    pub user: u16,
}

pub const ZERO_VERSIONSTAMP: Versionstamp = Versionstamp {
    tx: [0; 10],
    user: 0,
};

/// Hard cap on stamped user writes per transaction; the time-to-version
/// sentinel takes user version 65534 so it sorts after all of them.
pub const MAX_USER_VERSION: u16 = u16::MAX - 2;
pub const TTV_USER_VERSION: u16 = u16::MAX - 1;

impl Versionstamp {
    pub fn complete(tx: [u8; 10], user: u16) -> Self {
        Self { tx, user }
    }

    /// A placeholder stamp to be substituted with the commit version. The
    /// sentinel transaction bytes sort after every committed version.
    pub fn incomplete(user: u16) -> Self {
        Self {
            tx: INCOMPLETE_TX,
            user,
        }
    }

    pub fn is_incomplete(&self) -> bool {
        self.tx == INCOMPLETE_TX
    }

    pub fn is_zero(&self) -> bool {
        *self == ZERO_VERSIONSTAMP
    }

    pub fn bytes(&self) -> [u8; 12] {
        let mut out = [0u8; 12];
        out[..10].copy_from_slice(&self.tx);
        out[10..].copy_from_slice(&self.user.to_be_bytes());
        out
    }

    pub fn from_bytes(b: &[u8]) -> Result<Self> {
        if b.len() != 12 {
            return Err(RoomservError::InvalidVersion);
        }
        let mut tx = [0u8; 10];
        tx.copy_from_slice(&b[..10]);
        let user = u16::from_be_bytes([b[10], b[11]]);
        Ok(Self { tx, user })
    }

    /// Bump the user version by one, used to make a range start exclusive.
    pub fn next_user(mut self) -> Self {
        self.user = self.user.saturating_add(1);
        self
    }
}

impl fmt::Debug for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.tx {
            write!(f, "{b:02x}")?;
        }
        write!(f, "@{}", self.user)
    }
}

impl fmt::Display for Versionstamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    Bytes(Vec<u8>),
    Str(String),
    Int(i64),
    Version(Versionstamp),
}

impl From<&str> for Element {
    fn from(v: &str) -> Self {
        Element::Str(v.to_owned())
    }
}

impl From<String> for Element {
    fn from(v: String) -> Self {
        Element::Str(v)
    }
}

impl From<i64> for Element {
    fn from(v: i64) -> Self {
        Element::Int(v)
    }
}

impl From<Vec<u8>> for Element {
    fn from(v: Vec<u8>) -> Self {
        Element::Bytes(v)
    }
}

impl From<&[u8]> for Element {
    fn from(v: &[u8]) -> Self {
        Element::Bytes(v.to_vec())
    }
}

impl From<Versionstamp> for Element {
    fn from(v: Versionstamp) -> Self {
        Element::Version(v)
    }
}

fn encode_escaped(out: &mut Vec<u8>, data: &[u8]) {
    for &b in data {
        out.push(b);
        if b == 0x00 {
            out.push(0xff);
        }
    }
    out.push(0x00);
}

fn encode_element(out: &mut Vec<u8>, elem: &Element) -> Option<usize> {
    match elem {
        Element::Bytes(b) => {
            out.push(CODE_BYTES);
            encode_escaped(out, b);
            None
        }
        Element::Str(s) => {
            out.push(CODE_STRING);
            encode_escaped(out, s.as_bytes());
            None
        }
        Element::Int(v) => {
            encode_int(out, *v);
            None
        }
        Element::Version(v) => {
            out.push(CODE_VERSIONSTAMP);
            let offset = out.len();
            out.extend_from_slice(&v.bytes());
            if v.is_incomplete() {
                Some(offset)
            } else {
                None
            }
        }
    }
}

fn encode_int(out: &mut Vec<u8>, v: i64) {
    if v == 0 {
        out.push(CODE_INT_ZERO);
        return;
    }
    if v > 0 {
        let be = (v as u64).to_be_bytes();
        let skip = be.iter().take_while(|&&b| b == 0).count();
        out.push(CODE_INT_ZERO + (8 - skip) as u8);
        out.extend_from_slice(&be[skip..]);
    } else {
        let abs = (-(v as i128)) as u64;
        let mut n = 1;
        while n < 8 && abs > (1u64 << (8 * n)) - 1 {
            n += 1;
        }
        let max = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        let be = (max - abs).to_be_bytes();
        out.push(CODE_INT_ZERO - n as u8);
        out.extend_from_slice(&be[8 - n..]);
    }
}

/// Encode a tuple. Panics only on allocation failure; always succeeds.
pub fn pack(elems: &[Element]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elems.len() * 16);
    for elem in elems {
        encode_element(&mut out, elem);
    }
    out
}

/// Encode a tuple that carries exactly one incomplete versionstamp, returning
/// the byte offset where the commit version will be substituted.
pub fn pack_with_versionstamp(elems: &[Element]) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::with_capacity(elems.len() * 16);
    let mut stamp_offset = None;
    for elem in elems {
        if let Some(offset) = encode_element(&mut out, elem) {
            if stamp_offset.is_some() {
                return Err(RoomservError::Fatal(
                    "tuple contains more than one incomplete versionstamp".into(),
                ));
            }
            stamp_offset = Some(offset);
        }
    }
    match stamp_offset {
        Some(offset) => Ok((out, offset)),
        None => Err(RoomservError::Fatal(
            "tuple contains no incomplete versionstamp".into(),
        )),
    }
}

fn decode_escaped(data: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    while pos < data.len() {
        if data[pos] == 0x00 {
            if pos + 1 < data.len() && data[pos + 1] == 0xff {
                out.push(0x00);
                pos += 2;
            } else {
                return Ok((out, pos + 1));
            }
        } else {
            out.push(data[pos]);
            pos += 1;
        }
    }
    Err(RoomservError::Serialization(
        "unterminated tuple element".into(),
    ))
}

/// Decode a tuple previously produced by [`pack`].
pub fn unpack(data: &[u8]) -> Result<Vec<Element>> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        let code = data[pos];
        pos += 1;
        match code {
            CODE_BYTES => {
                let (bytes, next) = decode_escaped(data, pos)?;
                out.push(Element::Bytes(bytes));
                pos = next;
            }
            CODE_STRING => {
                let (bytes, next) = decode_escaped(data, pos)?;
                let s = String::from_utf8(bytes)
                    .map_err(|err| RoomservError::Serialization(err.to_string()))?;
                out.push(Element::Str(s));
                pos = next;
            }
            CODE_VERSIONSTAMP => {
                if pos + 12 > data.len() {
                    return Err(RoomservError::Serialization(
                        "truncated versionstamp element".into(),
                    ));
                }
                out.push(Element::Version(Versionstamp::from_bytes(
                    &data[pos..pos + 12],
                )?));
                pos += 12;
            }
            c if (0x0c..=0x1c).contains(&c) => {
                let (v, next) = decode_int(data, pos, c)?;
                out.push(Element::Int(v));
                pos = next;
            }
            other => {
                return Err(RoomservError::Serialization(format!(
                    "unknown tuple type code {other:#04x}"
                )));
            }
        }
    }
    Ok(out)
}

fn decode_int(data: &[u8], pos: usize, code: u8) -> Result<(i64, usize)> {
    if code == CODE_INT_ZERO {
        return Ok((0, pos));
    }
    let (n, negative) = if code > CODE_INT_ZERO {
        ((code - CODE_INT_ZERO) as usize, false)
    } else {
        ((CODE_INT_ZERO - code) as usize, true)
    };
    if pos + n > data.len() {
        return Err(RoomservError::Serialization(
            "truncated integer element".into(),
        ));
    }
    let mut be = [0u8; 8];
    be[8 - n..].copy_from_slice(&data[pos..pos + n]);
    let raw = u64::from_be_bytes(be);
    let v = if negative {
        let max = if n == 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        -((max - raw) as i128) as i64
    } else {
        i64::try_from(raw).map_err(|_| RoomservError::Serialization("integer overflow".into()))?
    };
    Ok((v, pos + n))
}

/// A keyspace rooted at a packed tuple prefix. Handles are immutable after
/// startup and shared freely.
#[derive(Debug, Clone)]
pub struct Subspace {
    prefix: Vec<u8>,
}

impl Subspace {
    pub fn new(elems: &[Element]) -> Self {
        Self {
            prefix: pack(elems),
        }
    }

    pub fn sub(&self, elem: impl Into<Element>) -> Subspace {
        let mut prefix = self.prefix.clone();
        encode_element(&mut prefix, &elem.into());
        Subspace { prefix }
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    pub fn pack(&self, elems: &[Element]) -> Vec<u8> {
        let mut out = self.prefix.clone();
        out.extend_from_slice(&pack(elems));
        out
    }

    pub fn pack_with_versionstamp(&self, elems: &[Element]) -> Result<(Vec<u8>, usize)> {
        let (tail, offset) = pack_with_versionstamp(elems)?;
        let mut out = self.prefix.clone();
        out.extend_from_slice(&tail);
        Ok((out, offset + self.prefix.len()))
    }

    pub fn unpack(&self, key: &[u8]) -> Result<Vec<Element>> {
        let rest = key.strip_prefix(self.prefix.as_slice()).ok_or_else(|| {
            RoomservError::Serialization("key does not belong to subspace".into())
        })?;
        unpack(rest)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        key.starts_with(&self.prefix)
    }

    /// The whole subspace as a `[begin, end)` byte range.
    pub fn range(&self) -> (Vec<u8>, Vec<u8>) {
        self.range_of(&[])
    }

    pub fn range_of(&self, elems: &[Element]) -> (Vec<u8>, Vec<u8>) {
        let prefix = self.pack(elems);
        let mut begin = prefix.clone();
        begin.push(0x00);
        let mut end = prefix;
        end.push(0xff);
        (begin, end)
    }

    /// Version-bounded range below `prefix_elems`. A zero `from` expands to
    /// just after the prefix, a zero `to` to just before prefix+1.
    pub fn version_range(
        &self,
        prefix_elems: &[Element],
        from: Versionstamp,
        to: Versionstamp,
    ) -> (Vec<u8>, Vec<u8>) {
        let packed = self.pack(prefix_elems);
        let begin = if from.is_zero() {
            let mut b = packed.clone();
            b.push(0x00);
            b
        } else {
            let mut b = packed.clone();
            b.extend_from_slice(&pack(&[Element::Version(from)]));
            b
        };
        let end = if to.is_zero() {
            let mut e = packed;
            e.push(0xff);
            e
        } else {
            let mut e = packed;
            e.extend_from_slice(&pack(&[Element::Version(to)]));
            e
        };
        (begin, end)
    }
}

/// Encode a versionstamp as a standalone stored value.
pub fn versionstamp_value(v: Versionstamp) -> Vec<u8> {
    pack(&[Element::Version(v)])
}

/// Offset of the substitutable bytes inside a [`versionstamp_value`].
pub const VERSIONSTAMP_VALUE_OFFSET: usize = 1;

pub fn value_to_versionstamp(value: &[u8]) -> Result<Versionstamp> {
    match unpack(value)?.first() {
        Some(Element::Version(v)) => Ok(*v),
        _ => Err(RoomservError::InvalidVersion),
    }
}

pub fn element_str(elem: &Element) -> Result<&str> {
    match elem {
        Element::Str(s) => Ok(s),
        _ => Err(RoomservError::Serialization(
            "expected string tuple element".into(),
        )),
    }
}

pub fn element_version(elem: &Element) -> Result<Versionstamp> {
    match elem {
        Element::Version(v) => Ok(*v),
        _ => Err(RoomservError::Serialization(
            "expected versionstamp tuple element".into(),
        )),
    }
}

pub fn element_bytes(elem: &Element) -> Result<&[u8]> {
    match elem {
        Element::Bytes(b) => Ok(b),
        _ => Err(RoomservError::Serialization(
            "expected bytes tuple element".into(),
        )),
    }
}

pub fn element_int(elem: &Element) -> Result<i64> {
    match elem {
        Element::Int(v) => Ok(*v),
        _ => Err(RoomservError::Serialization(
            "expected integer tuple element".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(elems: Vec<Element>) {
        let encoded = pack(&elems);
        let decoded = unpack(&encoded).unwrap();
        assert_eq!(decoded, elems);
    }

    #[test]
    fn roundtrips_all_element_kinds() {
        roundtrip(vec![
            Element::Str("!room:example.org".into()),
            Element::Bytes(vec![0x00, 0xff, 0x01]),
            Element::Int(0),
            Element::Int(42),
            Element::Int(-42),
            Element::Int(i64::MAX),
            Element::Int(i64::MIN + 1),
            Element::Version(Versionstamp::complete([1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 7)),
            Element::Version(Versionstamp::incomplete(3)),
        ]);
    }

    #[test]
    fn string_with_nul_roundtrips() {
        roundtrip(vec![Element::Str("a\u{0}b".into())]);
    }

    #[test]
    fn encoding_preserves_tuple_order() {
        let tuples = vec![
            vec![Element::Int(-300)],
            vec![Element::Int(-2)],
            vec![Element::Int(-1)],
            vec![Element::Int(0)],
            vec![Element::Int(1)],
            vec![Element::Int(255)],
            vec![Element::Int(256)],
            vec![Element::Str("a".into())],
            vec![Element::Str("a".into()), Element::Int(1)],
            vec![Element::Str("ab".into())],
            vec![Element::Version(Versionstamp::complete([0; 10], 1))],
            vec![Element::Version(Versionstamp::complete([0; 10], 2))],
            vec![Element::Version(Versionstamp::complete(
                [0, 0, 0, 0, 0, 0, 0, 0, 1, 0],
                0,
            ))],
        ];
        let encoded: Vec<Vec<u8>> = tuples.iter().map(|t| pack(t)).collect();
        let mut sorted = encoded.clone();
        sorted.sort();
        assert_eq!(encoded, sorted);
    }

    #[test]
    fn versionstamp_orders_by_bytes() {
        let a = Versionstamp::complete([0; 10], 5);
        let b = Versionstamp::complete([0; 10], 6);
        let c = Versionstamp::complete([0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 0);
        assert!(a < b);
        assert!(b < c);
        assert!(Versionstamp::incomplete(0) > c);
    }

    #[test]
    fn pack_with_versionstamp_reports_offset() {
        let sub = Subspace::new(&["ss".into()]);
        let (key, offset) = sub
            .pack_with_versionstamp(&[
                Element::Str("!r:s".into()),
                Element::Version(Versionstamp::incomplete(9)),
            ])
            .unwrap();
        // Substitute and verify the user version survived.
        let mut complete = key.clone();
        complete[offset..offset + 10].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 3]);
        let elems = sub.unpack(&complete).unwrap();
        let v = element_version(&elems[1]).unwrap();
        assert_eq!(v.user, 9);
        assert_eq!(v.tx[9], 3);
    }

    #[test]
    fn pack_with_versionstamp_rejects_zero_or_two_stamps() {
        assert!(pack_with_versionstamp(&[Element::Int(1)]).is_err());
        assert!(pack_with_versionstamp(&[
            Element::Version(Versionstamp::incomplete(0)),
            Element::Version(Versionstamp::incomplete(1)),
        ])
        .is_err());
    }

    #[test]
    fn version_range_sentinels_cover_whole_prefix() {
        let sub = Subspace::new(&["rmv".into()]);
        let (begin, end) =
            sub.version_range(&["!r:s".into()], ZERO_VERSIONSTAMP, ZERO_VERSIONSTAMP);
        let inside = sub.pack(&[
            Element::Str("!r:s".into()),
            Element::Version(Versionstamp::complete([0; 10], 0)),
        ]);
        assert!(begin < inside && inside < end);

        let other_room = sub.pack(&[
            Element::Str("!r:t".into()),
            Element::Version(Versionstamp::complete([0; 10], 0)),
        ]);
        assert!(other_room > end);
    }

    #[test]
    fn version_range_bounds_are_exclusive_of_to() {
        let sub = Subspace::new(&["ss".into()]);
        let v1 = Versionstamp::complete([0, 0, 0, 0, 0, 0, 0, 0, 0, 1], 0);
        let v2 = Versionstamp::complete([0, 0, 0, 0, 0, 0, 0, 0, 0, 2], 0);
        let (begin, end) = sub.version_range(&["!r:s".into()], v1, v2);
        let at_v1 = sub.pack(&[Element::Str("!r:s".into()), Element::Version(v1)]);
        let at_v2 = sub.pack(&[Element::Str("!r:s".into()), Element::Version(v2)]);
        assert_eq!(begin, at_v1);
        assert_eq!(end, at_v2);
    }

    #[test]
    fn versionstamp_value_roundtrips() {
        let v = Versionstamp::complete([9; 10], 1234);
        assert_eq!(value_to_versionstamp(&versionstamp_value(v)).unwrap(), v);
        let inc = Versionstamp::incomplete(77);
        assert_eq!(value_to_versionstamp(&versionstamp_value(inc)).unwrap(), inc);
    }
}
