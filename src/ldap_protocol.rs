// LDAP protocol handling with BER encoding/decoding
// Covers the LDAPv3 subset served by fakeldap (RFC 4511)

use crate::filter::Filter;
use anyhow::{Context, Result, bail};
use std::io::{Cursor, Read};

// LDAP Control (request)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub ctype: String,
    pub critical: bool,
    pub value: Option<Vec<u8>>,
}

// LDAP Message structure
#[derive(Debug, Clone)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

#[derive(Debug, Clone)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    AbandonRequest(i32),
    /// Request recognised by its tag but not served (ModifyDN, Compare, Extended).
    Unsupported(u8),
}

/// LDAPResult shared by every response PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::error(0, "")
    }

    pub fn error(result_code: i32, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            matched_dn: String::new(),
            diagnostic_message: diagnostic_message.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new(attr_type: impl Into<String>, values: &[String]) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values.iter().map(|v| v.as_bytes().to_vec()).collect(),
        }
    }

    /// First value decoded as UTF-8 (lossy).
    pub fn first_value(&self) -> Option<String> {
        self.attr_values
            .first()
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }
}

// BER parsing utilities
struct BerReader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn read_tag(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing tag")?;
        Ok(buf[0])
    }

    fn read_length(&mut self) -> Result<usize> {
        let mut buf = [0u8; 1];
        self.cursor.read_exact(&mut buf).context("BER truncated: missing length")?;
        let first_byte = buf[0];

        if (first_byte & 0x80) == 0 {
            // Short form
            Ok(first_byte as usize)
        } else {
            // Long form
            let length_bytes = (first_byte & 0x7F) as usize;
            if length_bytes == 0 {
                bail!("Indefinite length not supported");
            }
            if length_bytes > 4 {
                bail!("Length too large: {} bytes", length_bytes);
            }
            if self.remaining() < length_bytes {
                bail!("BER truncated: length encoding needs {} bytes, {} remaining", length_bytes, self.remaining());
            }
            let mut length = 0usize;
            for _ in 0..length_bytes {
                self.cursor.read_exact(&mut buf)?;
                length = (length << 8) | buf[0] as usize;
            }
            Ok(length)
        }
    }

    /// Next `len` bytes, borrowed from the underlying buffer.
    fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            bail!("BER truncated: need {} bytes, {} remaining", len, self.remaining());
        }
        let data: &'a [u8] = *self.cursor.get_ref();
        let start = self.cursor.position() as usize;
        self.cursor.set_position((start + len) as u64);
        Ok(&data[start..start + len])
    }

    /// One whole TLV: (tag, contents).
    fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.read_tag()?;
        let length = self.read_length()?;
        let value = self.read_slice(length)?;
        Ok((tag, value))
    }

    fn read_expected(&mut self, expected: u8, what: &str) -> Result<&'a [u8]> {
        let (tag, value) = self.read_tlv()?;
        if tag != expected {
            bail!("Expected {} tag (0x{:02X}), got: 0x{:02X}", what, expected, tag);
        }
        Ok(value)
    }

    fn read_integer(&mut self) -> Result<i32> {
        let bytes = self.read_expected(0x02, "INTEGER")?;
        decode_integer(bytes)
    }

    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        Ok(self.read_expected(0x04, "OCTET STRING")?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_octet_string()?;
        String::from_utf8(bytes).context("Invalid UTF-8 string")
    }

    /// Reader over the contents of the next SEQUENCE.
    fn read_sequence(&mut self) -> Result<BerReader<'a>> {
        Ok(BerReader::new(self.read_expected(0x30, "SEQUENCE")?))
    }

    /// Reader over the contents of the next SET (some clients send a SEQUENCE instead).
    fn read_set(&mut self) -> Result<BerReader<'a>> {
        let (tag, value) = self.read_tlv()?;
        if tag != 0x31 && tag != 0x30 {
            bail!("Expected SET tag (0x31), got: 0x{:02X}", tag);
        }
        Ok(BerReader::new(value))
    }

    fn read_enumerated(&mut self) -> Result<u8> {
        let bytes = self.read_expected(0x0A, "ENUMERATED")?;
        if bytes.len() != 1 {
            bail!("Enumerated value must be 1 byte, got: {}", bytes.len());
        }
        Ok(bytes[0])
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let bytes = self.read_expected(0x01, "BOOLEAN")?;
        if bytes.len() != 1 {
            bail!("Boolean value must be 1 byte, got: {}", bytes.len());
        }
        Ok(bytes[0] != 0)
    }

    fn remaining(&self) -> usize {
        let pos = self.cursor.position() as usize;
        let len = self.cursor.get_ref().len();
        len.saturating_sub(pos)
    }
}

fn decode_integer(bytes: &[u8]) -> Result<i32> {
    if bytes.is_empty() || bytes.len() > 4 {
        bail!("Invalid INTEGER length: {} bytes", bytes.len());
    }
    // Sign extension for negative numbers
    let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &byte in bytes {
        value = (value << 8) | byte as i32;
    }
    Ok(value)
}

// BER encoding utilities
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl Default for BerWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BerWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 128 {
            // Short form
            self.buffer.push(length as u8);
        } else {
            // Long form
            let bytes = length_octets(length);
            self.buffer.push(0x80 | bytes.len() as u8);
            self.buffer.extend_from_slice(&bytes);
        }
    }

    /// Minimal two's-complement encoding.
    pub fn write_integer(&mut self, value: i32) {
        let bytes = value.to_be_bytes();
        let mut start = 0;
        while start < 3 {
            let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
                || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
            if !redundant {
                break;
            }
            start += 1;
        }
        self.write_tag(0x02); // INTEGER tag
        self.write_length(4 - start);
        self.buffer.extend_from_slice(&bytes[start..]);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tag(0x04); // OCTET STRING tag
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    pub fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01); // BOOLEAN tag
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_enumerated(&mut self, value: u8) {
        self.write_tag(0x0A); // ENUMERATED tag
        self.write_length(1);
        self.buffer.push(value);
    }

    /// Writes `tag` and a one-byte length placeholder; returns the placeholder position
    /// for `end_constructed`.
    pub fn start_constructed(&mut self, tag: u8) -> usize {
        self.write_tag(tag);
        let pos = self.buffer.len();
        self.buffer.push(0);
        pos
    }

    /// Back-patches the length at `pos` for everything written since. Supports short and long form.
    pub fn end_constructed(&mut self, pos: usize) {
        let content_len = self.buffer.len() - (pos + 1);
        if content_len < 128 {
            self.buffer[pos] = content_len as u8;
        } else {
            let bytes = length_octets(content_len);
            self.buffer[pos] = 0x80 | bytes.len() as u8;
            self.buffer.splice(pos + 1..pos + 1, bytes);
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.start_constructed(0x30)
    }

    pub fn end_sequence(&mut self, start_pos: usize) {
        self.end_constructed(start_pos)
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

/// Big-endian bytes of `length` without leading zeros.
fn length_octets(length: usize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut len = length;
    while len > 0 {
        bytes.push((len & 0xFF) as u8);
        len >>= 8;
    }
    bytes.reverse();
    bytes
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;

/// Context [0] IMPLICIT SEQUENCE OF control
const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

// Filter CHOICE tags
const FILTER_AND: u8 = 0xA0;
const FILTER_OR: u8 = 0xA1;
const FILTER_NOT: u8 = 0xA2;
const FILTER_EQUALITY: u8 = 0xA3;
const FILTER_SUBSTRINGS: u8 = 0xA4;
const FILTER_GREATER_OR_EQUAL: u8 = 0xA5;
const FILTER_LESS_OR_EQUAL: u8 = 0xA6;
const FILTER_PRESENT: u8 = 0x87;
const FILTER_APPROX: u8 = 0xA8;
const FILTER_EXTENSIBLE: u8 = 0xA9;

const MAX_FILTER_DEPTH: usize = 32;

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Returns (message_id, request_tag) for building error responses when full parse fails.
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_tag = reader.read_tag()?;
    let _seq_len = reader.read_length()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut outer = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let mut reader = outer.read_sequence()?;

    let message_id = reader.read_integer()?;

    let (tag, body) = reader.read_tlv()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(body)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(body)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(body)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(body)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: String::from_utf8(body.to_vec()).context("Invalid UTF-8 in DelRequest DN")?,
        }),
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(decode_integer(body)?),
        LDAP_TAG_MODIFY_DN_REQUEST | LDAP_TAG_COMPARE_REQUEST | LDAP_TAG_EXTENDED_REQUEST => {
            ProtocolOp::Unsupported(tag)
        }
        _ => bail!("Unsupported LDAP operation tag: 0x{:02X}", tag),
    };

    let controls = if reader.remaining() > 0 {
        let (next_tag, value) = reader.read_tlv()?;
        if next_tag == LDAP_CONTEXT_CONTROLS {
            Some(parse_controls(value)?)
        } else {
            None
        }
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

/// Parse controls: SEQUENCE OF Control, each Control ::= SEQUENCE { type, critical DEFAULT FALSE, value OPTIONAL }
fn parse_controls(data: &[u8]) -> Result<Vec<Control>> {
    let mut reader = BerReader::new(data);
    let mut controls = Vec::new();
    while reader.remaining() > 0 {
        let mut ctrl = reader.read_sequence()?;
        let ctype = ctrl.read_string()?;
        let mut critical = false;
        let mut value = None;
        while ctrl.remaining() > 0 {
            let (tag, bytes) = ctrl.read_tlv()?;
            match tag {
                0x01 => critical = bytes.first().is_some_and(|b| *b != 0),
                0x04 => value = Some(bytes.to_vec()),
                _ => bail!("Unexpected tag 0x{:02X} in control {}", tag, ctype),
            }
        }
        controls.push(Control {
            ctype,
            critical,
            value,
        });
    }
    Ok(controls)
}

fn parse_bind_request(body: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(body);
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // Authentication: RFC 4511 simple is [0] IMPLICIT OCTET STRING (0x80), but clients send various tags.
    // Treat anything that is not SASL (0xA3) as simple bind.
    let (auth_tag, auth) = reader.read_tlv()?;
    let authentication = if auth_tag == 0xA3 {
        let mut sasl = BerReader::new(auth);
        let mechanism = sasl.read_string()?;
        let credentials = if sasl.remaining() > 0 {
            sasl.read_octet_string()?
        } else {
            Vec::new()
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        BindAuthentication::Simple(String::from_utf8(auth.to_vec()).context("Invalid UTF-8 password")?)
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_search_request(body: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(body);
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()?)?;
    let deref_aliases = reader.read_enumerated()? as i32;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;
    let filter = parse_filter(&mut reader, 0)?;

    let mut attrs_reader = reader.read_sequence()?;
    let mut attributes = Vec::new();
    while attrs_reader.remaining() > 0 {
        attributes.push(attrs_reader.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_filter(reader: &mut BerReader, depth: usize) -> Result<Filter> {
    if depth > MAX_FILTER_DEPTH {
        bail!("Filter nested deeper than {} levels", MAX_FILTER_DEPTH);
    }
    let (tag, content) = reader.read_tlv()?;
    let mut inner = BerReader::new(content);
    let filter = match tag {
        FILTER_AND | FILTER_OR => {
            let mut filters = Vec::new();
            while inner.remaining() > 0 {
                filters.push(parse_filter(&mut inner, depth + 1)?);
            }
            if tag == FILTER_AND {
                Filter::And(filters)
            } else {
                Filter::Or(filters)
            }
        }
        FILTER_NOT => Filter::Not(Box::new(parse_filter(&mut inner, depth + 1)?)),
        FILTER_EQUALITY => {
            let (attribute, value) = parse_assertion(&mut inner)?;
            Filter::Equality { attribute, value }
        }
        FILTER_GREATER_OR_EQUAL => {
            let (attribute, value) = parse_assertion(&mut inner)?;
            Filter::GreaterOrEqual { attribute, value }
        }
        FILTER_LESS_OR_EQUAL => {
            let (attribute, value) = parse_assertion(&mut inner)?;
            Filter::LessOrEqual { attribute, value }
        }
        FILTER_APPROX => {
            let (attribute, value) = parse_assertion(&mut inner)?;
            Filter::Approx { attribute, value }
        }
        FILTER_PRESENT => {
            Filter::Present(String::from_utf8(content.to_vec()).context("Invalid UTF-8 attribute")?)
        }
        FILTER_SUBSTRINGS => {
            let attribute = inner.read_string()?;
            let mut substrings = inner.read_sequence()?;
            let (mut initial, mut any, mut last) = (None, Vec::new(), None);
            while substrings.remaining() > 0 {
                let (sub_tag, bytes) = substrings.read_tlv()?;
                let part = String::from_utf8_lossy(bytes).into_owned();
                match sub_tag {
                    0x80 => initial = Some(part),
                    0x81 => any.push(part),
                    0x82 => last = Some(part),
                    _ => bail!("Invalid substring choice tag: 0x{:02X}", sub_tag),
                }
            }
            Filter::Substrings {
                attribute,
                initial,
                any,
                last,
            }
        }
        FILTER_EXTENSIBLE => {
            let (mut matching_rule, mut attribute, mut value, mut dn_attributes) = (None, None, None, false);
            while inner.remaining() > 0 {
                let (field_tag, bytes) = inner.read_tlv()?;
                match field_tag {
                    0x81 => matching_rule = Some(String::from_utf8_lossy(bytes).into_owned()),
                    0x82 => attribute = Some(String::from_utf8_lossy(bytes).into_owned()),
                    0x83 => value = Some(String::from_utf8_lossy(bytes).into_owned()),
                    0x84 => dn_attributes = bytes.first().is_some_and(|b| *b != 0),
                    _ => bail!("Invalid extensible match field tag: 0x{:02X}", field_tag),
                }
            }
            Filter::Extensible {
                matching_rule,
                attribute,
                value: value.context("Extensible match without matchValue")?,
                dn_attributes,
            }
        }
        _ => bail!("Invalid filter tag: 0x{:02X}", tag),
    };
    Ok(filter)
}

/// AttributeValueAssertion ::= SEQUENCE { attributeDesc, assertionValue OCTET STRING }
fn parse_assertion(reader: &mut BerReader) -> Result<(String, String)> {
    let attribute = reader.read_string()?;
    let value = reader.read_octet_string()?;
    Ok((attribute, String::from_utf8_lossy(&value).into_owned()))
}

fn parse_modify_request(body: &[u8]) -> Result<ModifyRequest> {
    let mut reader = BerReader::new(body);
    let object = reader.read_string()?;

    let mut changes_reader = reader.read_sequence()?;
    let mut changes = Vec::new();

    while changes_reader.remaining() > 0 {
        let mut change = changes_reader.read_sequence()?;
        let operation = change.read_enumerated()?;
        let modification = parse_attribute(&mut change)?;

        changes.push(ModifyChange {
            operation: match operation {
                0 => ModifyOperation::Add,
                1 => ModifyOperation::Delete,
                2 => ModifyOperation::Replace,
                _ => bail!("Invalid modify operation: {}", operation),
            },
            modification,
        });
    }

    Ok(ModifyRequest {
        object,
        changes,
    })
}

fn parse_add_request(body: &[u8]) -> Result<AddRequest> {
    let mut reader = BerReader::new(body);
    let entry = reader.read_string()?;

    let mut attrs_reader = reader.read_sequence()?;
    let mut attributes = Vec::new();

    while attrs_reader.remaining() > 0 {
        attributes.push(parse_attribute(&mut attrs_reader)?);
    }

    Ok(AddRequest {
        entry,
        attributes,
    })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    let mut seq = reader.read_sequence()?;
    let attr_type = seq.read_string()?;

    let mut vals = seq.read_set()?;
    let mut attr_values = Vec::new();

    while vals.remaining() > 0 {
        attr_values.push(vals.read_octet_string()?);
    }

    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindResponse(result) => {
            encode_ldap_result(&mut writer, LDAP_TAG_BIND_RESPONSE, result);
        }
        ProtocolOp::SearchResultEntry(entry) => {
            encode_search_result_entry(&mut writer, entry);
        }
        ProtocolOp::SearchResultDone(result) => {
            encode_ldap_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, result);
        }
        ProtocolOp::ModifyResponse(result) => {
            encode_ldap_result(&mut writer, LDAP_TAG_MODIFY_RESPONSE, result);
        }
        ProtocolOp::AddResponse(result) => {
            encode_ldap_result(&mut writer, LDAP_TAG_ADD_RESPONSE, result);
        }
        ProtocolOp::DelResponse(result) => {
            encode_ldap_result(&mut writer, LDAP_TAG_DEL_RESPONSE, result);
        }
        _ => bail!("Cannot encode operation type"),
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

/// Writes `[APPLICATION n] LDAPResult` for any response tag.
pub fn encode_ldap_result(writer: &mut BerWriter, response_tag: u8, result: &LdapResult) {
    let pos = writer.start_constructed(response_tag);
    writer.write_enumerated(result.result_code as u8);
    writer.write_string(&result.matched_dn);
    writer.write_string(&result.diagnostic_message);
    writer.end_constructed(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    let pos = writer.start_constructed(LDAP_TAG_SEARCH_RESULT_ENTRY);
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.end_constructed(pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    let vals_start = writer.start_constructed(0x31); // SET OF value
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.end_constructed(vals_start);

    writer.end_sequence(seq_start);
}
