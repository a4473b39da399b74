//! X/Open transaction identifiers
//!
//! An XID is the wire-level identity of one transaction branch: a format id
//! plus two byte sequences (`gtrid`, `bqual`). Two XIDs are equal iff all
//! three fields match byte-exactly.
//!
//! XIDs come in two flavors. *External* XIDs are supplied by a transaction
//! manager through `XA START`. *Internal* XIDs are minted by the server for
//! its own two-phase commit between storage engines and the binlog; they
//! carry a fixed prefix, the server id and a monotonic transaction id, and
//! `my_xid` recovers that id during crash recovery.

use std::fmt;

/// Maximum combined length of `gtrid` and `bqual`.
pub const XID_DATA_SIZE: usize = 128;
/// Maximum length of the global transaction id part.
pub const MAX_GTRID: usize = 64;
/// Maximum length of the branch qualifier part.
pub const MAX_BQUAL: usize = 64;

/// Sentinel transaction id encoded for queries that run before the server
/// assigns real transaction ids (bootstrap and early-startup statements).
///
/// An internal XID is never minted with id 0, so 0 stays free to mean
/// "external" in [`Xid::my_xid`]. This sentinel is a workaround that should
/// be revisited if the classifier is ever redesigned.
pub const INTERNAL_SYSTEM_XID: u64 = u64::MAX;

/// 8-byte marker opening every internally generated gtrid.
const INTERNAL_PREFIX: &[u8; 8] = b"TandemXa";
/// Offset of the embedded transaction id: prefix + 4-byte server id.
const INTERNAL_OFFSET: usize = INTERNAL_PREFIX.len() + 4;
/// Total gtrid length of an internal XID.
const INTERNAL_GTRID_LEN: usize = INTERNAL_OFFSET + 8;

/// The binlog's prepared-id snapshot joins ids with this byte, so external
/// XIDs may not contain it.
const RESERVED_BYTE: u8 = b'|';

/// Errors from [`Xid::parse`], [`Xid::parse_quoted`] and [`Xid::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XidParseError {
    /// A quote or comma delimiter was missing or misplaced.
    MissingDelimiter,
    /// A hex section had an odd number of digits.
    OddHexLength,
    /// A hex section contained a non-hex character.
    InvalidHexDigit,
    /// The trailing format id was missing or not a number.
    BadFormatId,
    /// `gtrid` was empty or longer than [`MAX_GTRID`].
    GtridLength,
    /// `bqual` was longer than [`MAX_BQUAL`].
    BqualLength,
}

impl fmt::Display for XidParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            XidParseError::MissingDelimiter => "missing delimiter",
            XidParseError::OddHexLength => "odd-length hex section",
            XidParseError::InvalidHexDigit => "invalid hex digit",
            XidParseError::BadFormatId => "format id is not numeric",
            XidParseError::GtridLength => "gtrid length out of range",
            XidParseError::BqualLength => "bqual length out of range",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for XidParseError {}

/// An X/Open transaction identifier.
#[derive(Clone, Copy)]
pub struct Xid {
    format_id: i32,
    gtrid_length: usize,
    bqual_length: usize,
    data: [u8; XID_DATA_SIZE],
}

impl Xid {
    /// Build an XID from its three fields, enforcing the X/Open bounds:
    /// `gtrid` 1..=64 bytes, `bqual` 0..=64 bytes.
    pub fn new(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> Result<Self, XidParseError> {
        if gtrid.is_empty() {
            return Err(XidParseError::GtridLength);
        }
        Self::from_parts(format_id, gtrid, bqual)
    }

    /// Like [`Xid::new`] but tolerates an empty gtrid. The text parsers use
    /// this: the literal form allows both hex sections to be empty.
    fn from_parts(format_id: i32, gtrid: &[u8], bqual: &[u8]) -> Result<Self, XidParseError> {
        if gtrid.len() > MAX_GTRID {
            return Err(XidParseError::GtridLength);
        }
        if bqual.len() > MAX_BQUAL {
            return Err(XidParseError::BqualLength);
        }
        let mut data = [0u8; XID_DATA_SIZE];
        data[..gtrid.len()].copy_from_slice(gtrid);
        data[gtrid.len()..gtrid.len() + bqual.len()].copy_from_slice(bqual);
        Ok(Self {
            format_id,
            gtrid_length: gtrid.len(),
            bqual_length: bqual.len(),
            data,
        })
    }

    /// The null XID, used by sessions with no branch.
    pub fn null() -> Self {
        Self {
            format_id: -1,
            gtrid_length: 0,
            bqual_length: 0,
            data: [0u8; XID_DATA_SIZE],
        }
    }

    /// Mint an internal XID for the server's own two-phase commit.
    ///
    /// Transaction id 0 is reserved for pre-connection statements and is
    /// stored as [`INTERNAL_SYSTEM_XID`].
    pub fn internal(server_id: u32, my_xid: u64) -> Self {
        let id = if my_xid == 0 { INTERNAL_SYSTEM_XID } else { my_xid };
        let mut data = [0u8; XID_DATA_SIZE];
        data[..INTERNAL_PREFIX.len()].copy_from_slice(INTERNAL_PREFIX);
        data[INTERNAL_PREFIX.len()..INTERNAL_OFFSET].copy_from_slice(&server_id.to_le_bytes());
        data[INTERNAL_OFFSET..INTERNAL_GTRID_LEN].copy_from_slice(&id.to_le_bytes());
        Self {
            format_id: 1,
            gtrid_length: INTERNAL_GTRID_LEN,
            bqual_length: 0,
            data,
        }
    }

    /// The embedded transaction id if this XID is internally generated,
    /// 0 otherwise.
    pub fn my_xid(&self) -> u64 {
        if self.gtrid_length == INTERNAL_GTRID_LEN
            && self.bqual_length == 0
            && self.data[..INTERNAL_PREFIX.len()] == INTERNAL_PREFIX[..]
        {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&self.data[INTERNAL_OFFSET..INTERNAL_GTRID_LEN]);
            return u64::from_le_bytes(buf);
        }
        0
    }

    pub fn is_null(&self) -> bool {
        self.format_id == -1
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn gtrid_length(&self) -> usize {
        self.gtrid_length
    }

    pub fn bqual_length(&self) -> usize {
        self.bqual_length
    }

    /// The global transaction id bytes. Binlog recovery sets and the
    /// prepared-id registry are keyed by exactly these bytes.
    pub fn gtrid(&self) -> &[u8] {
        &self.data[..self.gtrid_length]
    }

    pub fn bqual(&self) -> &[u8] {
        &self.data[self.gtrid_length..self.gtrid_length + self.bqual_length]
    }

    /// `gtrid` and `bqual` back to back, as stored.
    pub fn data_bytes(&self) -> &[u8] {
        &self.data[..self.gtrid_length + self.bqual_length]
    }

    /// Cache key: the data bytes followed by both length prefixes, so equal
    /// XIDs always produce equal keys.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.gtrid_length + self.bqual_length + 2);
        key.extend_from_slice(self.data_bytes());
        key.push(self.gtrid_length as u8);
        key.push(self.bqual_length as u8);
        key
    }

    /// True if any data byte is the `'|'` delimiter the binlog prepared-id
    /// snapshot uses. `XA START` rejects such XIDs.
    pub fn contains_reserved_byte(&self) -> bool {
        self.data_bytes().contains(&RESERVED_BYTE)
    }

    /// Literal text form: `X'<hex-gtrid>',X'<hex-bqual>',<formatID>`.
    pub fn serialize(&self) -> String {
        format!(
            "X'{}',X'{}',{}",
            hex::encode(self.gtrid()),
            hex::encode(self.bqual()),
            self.format_id
        )
    }

    /// Quoted compatibility form: the raw gtrid bytes between single
    /// quotes. Only produced in `ddc_mode`, where `bqual` is empty.
    pub fn serialize_quoted(&self) -> String {
        format!("'{}'", String::from_utf8_lossy(self.gtrid()))
    }

    /// `0x`-prefixed hex of the data bytes, for `XA RECOVER CONVERT XID`.
    pub fn to_hex_literal(&self) -> String {
        format!("0x{}", hex::encode(self.data_bytes()))
    }

    /// Parse the literal form. Both hex sections may be empty; the format
    /// id must be a plain decimal number.
    pub fn parse(input: &str) -> Result<Self, XidParseError> {
        let rest = input
            .strip_prefix("X'")
            .ok_or(XidParseError::MissingDelimiter)?;
        let (gtrid_hex, rest) = rest
            .split_once('\'')
            .ok_or(XidParseError::MissingDelimiter)?;
        let rest = rest
            .strip_prefix(",X'")
            .ok_or(XidParseError::MissingDelimiter)?;
        let (bqual_hex, rest) = rest
            .split_once('\'')
            .ok_or(XidParseError::MissingDelimiter)?;
        let fmt = rest.strip_prefix(',').ok_or(XidParseError::MissingDelimiter)?;
        if fmt.is_empty() || !fmt.bytes().all(|b| b.is_ascii_digit()) {
            return Err(XidParseError::BadFormatId);
        }
        let format_id: i32 = fmt.parse().map_err(|_| XidParseError::BadFormatId)?;
        let gtrid = decode_hex(gtrid_hex)?;
        let bqual = decode_hex(bqual_hex)?;
        Self::from_parts(format_id, &gtrid, &bqual)
    }

    /// Parse the quoted compatibility form: single-quoted raw bytes,
    /// `bqual_length = 0`, format id 1.
    pub fn parse_quoted(input: &str) -> Result<Self, XidParseError> {
        let bytes = input.as_bytes();
        if bytes.len() < 3 || bytes[0] != b'\'' || bytes[bytes.len() - 1] != b'\'' {
            return Err(XidParseError::MissingDelimiter);
        }
        Self::new(1, &bytes[1..bytes.len() - 1], &[])
    }
}

fn decode_hex(section: &str) -> Result<Vec<u8>, XidParseError> {
    hex::decode(section).map_err(|e| match e {
        hex::FromHexError::OddLength => XidParseError::OddHexLength,
        _ => XidParseError::InvalidHexDigit,
    })
}

impl PartialEq for Xid {
    fn eq(&self, other: &Self) -> bool {
        self.format_id == other.format_id
            && self.gtrid_length == other.gtrid_length
            && self.bqual_length == other.bqual_length
            && self.data_bytes() == other.data_bytes()
    }
}

impl Eq for Xid {}

impl std::hash::Hash for Xid {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.format_id.hash(state);
        self.gtrid_length.hash(state);
        self.bqual_length.hash(state);
        self.data_bytes().hash(state);
    }
}

impl fmt::Debug for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid({})", self.serialize())
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xid(gtrid: &[u8], bqual: &[u8]) -> Xid {
        Xid::new(1, gtrid, bqual).unwrap()
    }

    #[test]
    fn test_equality_is_byte_exact() {
        assert_eq!(xid(b"t1", b""), xid(b"t1", b""));
        assert_ne!(xid(b"t1", b""), xid(b"t1", b"b"));
        assert_ne!(xid(b"t1", b""), xid(b"t2", b""));
        assert_ne!(xid(b"t1", b""), Xid::new(2, b"t1", b"").unwrap());
    }

    #[test]
    fn test_equal_xids_have_equal_keys() {
        assert_eq!(xid(b"ab", b"cd").key(), xid(b"ab", b"cd").key());
        // Same concatenated data, different split: keys must differ.
        assert_ne!(xid(b"abc", b"d").key(), xid(b"ab", b"cd").key());
    }

    #[test]
    fn test_bounds() {
        assert_eq!(Xid::new(1, b"", b""), Err(XidParseError::GtridLength));
        assert_eq!(
            Xid::new(1, &[0u8; MAX_GTRID + 1], b""),
            Err(XidParseError::GtridLength)
        );
        assert_eq!(
            Xid::new(1, b"g", &[0u8; MAX_BQUAL + 1]),
            Err(XidParseError::BqualLength)
        );
        assert!(Xid::new(1, &[0u8; MAX_GTRID], &[0u8; MAX_BQUAL]).is_ok());
    }

    #[test]
    fn test_internal_classification() {
        for n in [1u64, 42, u64::MAX - 1] {
            assert_eq!(Xid::internal(7, n).my_xid(), n);
        }
        assert_eq!(Xid::internal(7, 0).my_xid(), INTERNAL_SYSTEM_XID);
        assert_eq!(xid(b"external", b"").my_xid(), 0);
        // A gtrid of the right length but wrong prefix is external.
        assert_eq!(xid(&[0u8; 20], b"").my_xid(), 0);
    }

    #[test]
    fn test_internal_layout() {
        let x = Xid::internal(0xAABBCCDD, 99);
        assert_eq!(x.format_id(), 1);
        assert_eq!(x.gtrid_length(), 20);
        assert_eq!(x.bqual_length(), 0);
        assert_eq!(&x.gtrid()[..8], b"TandemXa");
    }

    #[test]
    fn test_literal_roundtrip() {
        for x in [
            xid(b"t1", b""),
            xid(b"hello", b"world"),
            xid(&[0x00, 0xff, 0x7c], b"\x01\x02"),
            Xid::internal(3, 12345),
        ] {
            assert_eq!(Xid::parse(&x.serialize()).unwrap(), x);
        }
    }

    #[test]
    fn test_literal_parse() {
        let x = Xid::parse("X'7431',X'',1").unwrap();
        assert_eq!(x.gtrid(), b"t1");
        assert_eq!(x.bqual_length(), 0);
        assert_eq!(x.format_id(), 1);
    }

    #[test]
    fn test_literal_parse_rejects_malformed() {
        assert_eq!(Xid::parse("7431',X'',1"), Err(XidParseError::MissingDelimiter));
        assert_eq!(Xid::parse("X'7431'X'',1"), Err(XidParseError::MissingDelimiter));
        assert_eq!(Xid::parse("X'7431',X''"), Err(XidParseError::MissingDelimiter));
        assert_eq!(Xid::parse("X'743',X'',1"), Err(XidParseError::OddHexLength));
        assert_eq!(Xid::parse("X'74zz',X'',1"), Err(XidParseError::InvalidHexDigit));
        assert_eq!(Xid::parse("X'7431',X'',"), Err(XidParseError::BadFormatId));
        assert_eq!(Xid::parse("X'7431',X'',one"), Err(XidParseError::BadFormatId));
    }

    #[test]
    fn test_quoted_roundtrip() {
        let x = xid(b"branch-9", b"");
        assert_eq!(Xid::parse_quoted(&x.serialize_quoted()).unwrap(), x);
        assert_eq!(Xid::parse_quoted("''"), Err(XidParseError::MissingDelimiter));
        assert_eq!(Xid::parse_quoted("'abc"), Err(XidParseError::MissingDelimiter));
    }

    #[test]
    fn test_reserved_byte() {
        assert!(xid(b"a|b", b"").contains_reserved_byte());
        assert!(xid(b"ab", b"|").contains_reserved_byte());
        assert!(!xid(b"ab", b"cd").contains_reserved_byte());
    }

    #[test]
    fn test_hex_literal() {
        assert_eq!(xid(b"t1", b"").to_hex_literal(), "0x7431");
    }

    #[test]
    fn test_null() {
        let x = Xid::null();
        assert!(x.is_null());
        assert_eq!(x.my_xid(), 0);
    }
}
