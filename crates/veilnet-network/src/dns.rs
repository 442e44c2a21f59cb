//! DNS wire codec
//!
//! A small hand-rolled codec covering exactly what the exit resolver
//! needs: decode incoming queries, and build A / PTR / error replies.
//! Upstream responses are relayed as raw bytes and never re-parsed.

use std::net::Ipv4Addr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// A record query type
pub const QTYPE_A: u16 = 1;
/// PTR record query type
pub const QTYPE_PTR: u16 = 12;
/// Internet class
pub const CLASS_IN: u16 = 1;

/// No error
pub const RCODE_NO_ERROR: u8 = 0;
/// Server failure
pub const RCODE_SERVFAIL: u8 = 2;
/// Name does not exist
pub const RCODE_NXDOMAIN: u8 = 3;

/// Reverse-lookup zone suffix
const IN_ADDR_ARPA: &str = ".in-addr.arpa";

/// Upper bound on question/record counts we are willing to decode
const MAX_SECTION_ENTRIES: u16 = 32;

/// A single DNS question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Question {
    pub qname: String,
    pub qtype: u16,
    pub qclass: u16,
}

/// A resource record in an answer section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub name: String,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// A decoded DNS message (header, questions and answers only)
#[derive(Debug, Clone)]
pub struct Message {
    pub id: u16,
    pub response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
}

impl Message {
    /// Build a plain query for one question
    pub fn query(id: u16, qname: &str, qtype: u16) -> Self {
        Self {
            id,
            response: false,
            opcode: 0,
            authoritative: false,
            recursion_desired: true,
            recursion_available: false,
            rcode: RCODE_NO_ERROR,
            questions: vec![Question {
                qname: qname.to_string(),
                qtype,
                qclass: CLASS_IN,
            }],
            answers: Vec::new(),
        }
    }

    /// Start an (authoritative) reply to this query
    pub fn reply_to(&self) -> Self {
        Self {
            id: self.id,
            response: true,
            opcode: self.opcode,
            authoritative: true,
            recursion_desired: self.recursion_desired,
            recursion_available: true,
            rcode: RCODE_NO_ERROR,
            questions: self.questions.clone(),
            answers: Vec::new(),
        }
    }

    /// An NXDOMAIN reply to this query
    pub fn nxdomain(&self) -> Self {
        let mut reply = self.reply_to();
        reply.rcode = RCODE_NXDOMAIN;
        reply
    }

    /// A SERVFAIL reply to this query
    pub fn servfail(&self) -> Self {
        let mut reply = self.reply_to();
        reply.rcode = RCODE_SERVFAIL;
        reply
    }

    /// Append an A answer
    pub fn push_a(&mut self, name: &str, ip: Ipv4Addr, ttl: u32) {
        self.answers.push(Record {
            name: name.to_string(),
            rtype: QTYPE_A,
            rclass: CLASS_IN,
            ttl,
            rdata: ip.octets().to_vec(),
        });
    }

    /// Append a PTR answer pointing at `target`
    pub fn push_ptr(&mut self, name: &str, target: &str, ttl: u32) {
        let mut rdata = BytesMut::new();
        encode_name(&mut rdata, target);
        self.answers.push(Record {
            name: name.to_string(),
            rtype: QTYPE_PTR,
            rclass: CLASS_IN,
            ttl,
            rdata: rdata.to_vec(),
        });
    }

    /// Decode a message from raw bytes
    pub fn parse(buf: &[u8]) -> NetworkResult<Self> {
        if buf.len() < 12 {
            return Err(NetworkError::DnsDecode(format!(
                "short message: {} bytes",
                buf.len()
            )));
        }

        let id = u16::from_be_bytes([buf[0], buf[1]]);
        let flags = u16::from_be_bytes([buf[2], buf[3]]);
        let qdcount = u16::from_be_bytes([buf[4], buf[5]]);
        let ancount = u16::from_be_bytes([buf[6], buf[7]]);
        if qdcount > MAX_SECTION_ENTRIES || ancount > MAX_SECTION_ENTRIES {
            return Err(NetworkError::DnsDecode("oversized section".into()));
        }

        let mut offset = 12;
        let mut questions = Vec::with_capacity(qdcount as usize);
        for _ in 0..qdcount {
            let (qname, next) = decode_name(buf, offset)?;
            if next + 4 > buf.len() {
                return Err(NetworkError::DnsDecode("truncated question".into()));
            }
            let qtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
            let qclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
            offset = next + 4;
            questions.push(Question {
                qname,
                qtype,
                qclass,
            });
        }

        let mut answers = Vec::with_capacity(ancount as usize);
        for _ in 0..ancount {
            let (name, next) = decode_name(buf, offset)?;
            if next + 10 > buf.len() {
                return Err(NetworkError::DnsDecode("truncated record".into()));
            }
            let rtype = u16::from_be_bytes([buf[next], buf[next + 1]]);
            let rclass = u16::from_be_bytes([buf[next + 2], buf[next + 3]]);
            let ttl = u32::from_be_bytes([
                buf[next + 4],
                buf[next + 5],
                buf[next + 6],
                buf[next + 7],
            ]);
            let rdlen = u16::from_be_bytes([buf[next + 8], buf[next + 9]]) as usize;
            let rdata_start = next + 10;
            if rdata_start + rdlen > buf.len() {
                return Err(NetworkError::DnsDecode("truncated rdata".into()));
            }
            answers.push(Record {
                name,
                rtype,
                rclass,
                ttl,
                rdata: buf[rdata_start..rdata_start + rdlen].to_vec(),
            });
            offset = rdata_start + rdlen;
        }

        Ok(Self {
            id,
            response: flags & 0x8000 != 0,
            opcode: ((flags >> 11) & 0x0F) as u8,
            authoritative: flags & 0x0400 != 0,
            recursion_desired: flags & 0x0100 != 0,
            recursion_available: flags & 0x0080 != 0,
            rcode: (flags & 0x000F) as u8,
            questions,
            answers,
        })
    }

    /// Encode to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);

        buf.put_u16(self.id);
        let mut flags: u16 = 0;
        if self.response {
            flags |= 0x8000;
        }
        flags |= ((self.opcode & 0x0F) as u16) << 11;
        if self.authoritative {
            flags |= 0x0400;
        }
        if self.recursion_desired {
            flags |= 0x0100;
        }
        if self.recursion_available {
            flags |= 0x0080;
        }
        flags |= (self.rcode & 0x0F) as u16;
        buf.put_u16(flags);
        buf.put_u16(self.questions.len() as u16);
        buf.put_u16(self.answers.len() as u16);
        buf.put_u16(0); // nscount
        buf.put_u16(0); // arcount

        for q in &self.questions {
            encode_name(&mut buf, &q.qname);
            buf.put_u16(q.qtype);
            buf.put_u16(q.qclass);
        }
        for r in &self.answers {
            encode_name(&mut buf, &r.name);
            buf.put_u16(r.rtype);
            buf.put_u16(r.rclass);
            buf.put_u32(r.ttl);
            buf.put_u16(r.rdata.len() as u16);
            buf.put_slice(&r.rdata);
        }

        buf.freeze()
    }
}

/// Encode a dotted name as length-prefixed labels
fn encode_name(buf: &mut BytesMut, name: &str) {
    for label in name.trim_end_matches('.').split('.') {
        let label = label.as_bytes();
        let len = label.len().min(63);
        buf.put_u8(len as u8);
        buf.put_slice(&label[..len]);
    }
    buf.put_u8(0);
}

/// Decode a name starting at `offset`, following compression pointers.
///
/// Returns the dotted name and the offset just past the name in the
/// original (non-pointer) position.
fn decode_name(buf: &[u8], offset: usize) -> NetworkResult<(String, usize)> {
    let mut name = String::new();
    let mut pos = offset;
    let mut end = 0usize;
    let mut jumps = 0;

    loop {
        if pos >= buf.len() {
            return Err(NetworkError::DnsDecode("name runs past buffer".into()));
        }
        let len = buf[pos] as usize;
        if len == 0 {
            if end == 0 {
                end = pos + 1;
            }
            break;
        }
        if len & 0xC0 == 0xC0 {
            // compression pointer
            if pos + 1 >= buf.len() {
                return Err(NetworkError::DnsDecode("truncated pointer".into()));
            }
            if end == 0 {
                end = pos + 2;
            }
            jumps += 1;
            if jumps > 8 {
                return Err(NetworkError::DnsDecode("pointer loop".into()));
            }
            pos = ((len & 0x3F) << 8) | buf[pos + 1] as usize;
            continue;
        }
        if len > 63 || pos + 1 + len > buf.len() {
            return Err(NetworkError::DnsDecode("bad label".into()));
        }
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(&buf[pos + 1..pos + 1 + len]));
        pos += 1 + len;
        if name.len() > 255 {
            return Err(NetworkError::DnsDecode("name too long".into()));
        }
    }

    Ok((name, end))
}

/// Decode a reverse-lookup question name into the queried address.
///
/// `2.0.0.10.in-addr.arpa` → `10.0.0.2`
pub fn decode_ptr_name(qname: &str) -> Option<Ipv4Addr> {
    let base = qname.trim_end_matches('.').strip_suffix(IN_ADDR_ARPA)?;
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in base.trim_end_matches('.').split('.') {
        if count >= 4 {
            return None;
        }
        octets[count] = part.parse().ok()?;
        count += 1;
    }
    if count != 4 {
        return None;
    }
    // labels are in reversed octet order
    Some(Ipv4Addr::new(octets[3], octets[2], octets[1], octets[0]))
}

/// Build the reverse-lookup question name for an address
pub fn ptr_qname(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("{}.{}.{}.{}{}", o[3], o[2], o[1], o[0], IN_ADDR_ARPA)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_roundtrip() {
        let msg = Message::query(0x1234, "example.com", QTYPE_A);
        let bytes = msg.to_bytes();
        let parsed = Message::parse(&bytes).unwrap();

        assert_eq!(parsed.id, 0x1234);
        assert!(!parsed.response);
        assert!(parsed.recursion_desired);
        assert_eq!(parsed.questions.len(), 1);
        assert_eq!(parsed.questions[0].qname, "example.com");
        assert_eq!(parsed.questions[0].qtype, QTYPE_A);
        assert_eq!(parsed.questions[0].qclass, CLASS_IN);
    }

    #[test]
    fn test_a_reply_roundtrip() {
        let query = Message::query(7, "node.snode", QTYPE_A);
        let mut reply = query.reply_to();
        reply.push_a("node.snode", Ipv4Addr::new(10, 0, 0, 2), 300);

        let parsed = Message::parse(&reply.to_bytes()).unwrap();
        assert!(parsed.response);
        assert!(parsed.authoritative);
        assert_eq!(parsed.rcode, RCODE_NO_ERROR);
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].rtype, QTYPE_A);
        assert_eq!(parsed.answers[0].rdata, vec![10, 0, 0, 2]);
    }

    #[test]
    fn test_ptr_reply_roundtrip() {
        let query = Message::query(9, "2.0.0.10.in-addr.arpa", QTYPE_PTR);
        let mut reply = query.reply_to();
        reply.push_ptr("2.0.0.10.in-addr.arpa", "somerouter.snode", 300);

        let parsed = Message::parse(&reply.to_bytes()).unwrap();
        assert_eq!(parsed.answers.len(), 1);
        assert_eq!(parsed.answers[0].rtype, QTYPE_PTR);

        // rdata is an encoded name
        let (target, _) = decode_name(&parsed.answers[0].rdata, 0).unwrap();
        assert_eq!(target, "somerouter.snode");
    }

    #[test]
    fn test_nxdomain() {
        let query = Message::query(3, "nope.snode", QTYPE_A);
        let parsed = Message::parse(&query.nxdomain().to_bytes()).unwrap();
        assert_eq!(parsed.rcode, RCODE_NXDOMAIN);
        assert!(parsed.answers.is_empty());
    }

    #[test]
    fn test_decode_ptr_name() {
        assert_eq!(
            decode_ptr_name("2.0.0.10.in-addr.arpa"),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(
            decode_ptr_name("1.0.168.192.in-addr.arpa."),
            Some(Ipv4Addr::new(192, 168, 0, 1))
        );
        assert_eq!(decode_ptr_name("example.com"), None);
        assert_eq!(decode_ptr_name("1.2.3.in-addr.arpa"), None);
        assert_eq!(decode_ptr_name("300.0.0.10.in-addr.arpa"), None);
        assert_eq!(decode_ptr_name("1.2.3.4.5.in-addr.arpa"), None);
    }

    #[test]
    fn test_ptr_qname_roundtrip() {
        let ip = Ipv4Addr::new(10, 11, 12, 13);
        assert_eq!(decode_ptr_name(&ptr_qname(ip)), Some(ip));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Message::parse(&[]).is_err());
        assert!(Message::parse(&[0u8; 5]).is_err());

        // claims one question but has none
        let mut hdr = vec![0u8; 12];
        hdr[5] = 1;
        assert!(Message::parse(&hdr).is_err());
    }

    #[test]
    fn test_compression_pointer() {
        // header + question with name at offset 12, then a record name
        // that is just a pointer back to it
        let query = Message::query(1, "a.example.com", QTYPE_A);
        let mut bytes = query.to_bytes().to_vec();
        // patch ancount to 1 and append a pointer-named A record
        bytes[7] = 1;
        bytes.extend_from_slice(&[0xC0, 12]); // pointer to offset 12
        bytes.extend_from_slice(&QTYPE_A.to_be_bytes());
        bytes.extend_from_slice(&CLASS_IN.to_be_bytes());
        bytes.extend_from_slice(&300u32.to_be_bytes());
        bytes.extend_from_slice(&4u16.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);

        let parsed = Message::parse(&bytes).unwrap();
        assert_eq!(parsed.answers[0].name, "a.example.com");
        assert_eq!(parsed.answers[0].rdata, vec![1, 2, 3, 4]);
    }
}
