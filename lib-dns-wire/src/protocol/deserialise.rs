//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.

use bytes::Bytes;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::protocol::types::*;

impl Message {
    /// Parse a whole message.
    ///
    /// # Errors
    ///
    /// If the message cannot be parsed.  The error carries the header
    /// whenever the first 12 octets were themselves intact, plus any
    /// questions parsed before the failure, so a client can still
    /// tell which of its queries a mangled response belonged to.
    pub fn from_octets(octets: &[u8]) -> Result<Self, MessageError> {
        let mut buffer = ConsumableBuffer::new(octets);

        let wire_header = match WireHeader::deserialise(&mut buffer) {
            Ok(wire_header) => wire_header,
            Err(error) => {
                return Err(MessageError {
                    header: None,
                    questions: Vec::new(),
                    error,
                })
            }
        };

        let mut questions = Vec::with_capacity(wire_header.qdcount.into());
        for _ in 0..wire_header.qdcount {
            match Question::deserialise(&mut buffer) {
                Ok(question) => questions.push(question),
                Err(error) => {
                    return Err(MessageError {
                        header: Some(wire_header.header),
                        questions,
                        error,
                    })
                }
            }
        }

        match Self::deserialise_records(&wire_header, &mut buffer) {
            Ok((answers, authority, additional)) => Ok(Self {
                header: wire_header.header,
                questions,
                answers,
                authority,
                additional,
            }),
            Err(error) => Err(MessageError {
                header: Some(wire_header.header),
                questions,
                error,
            }),
        }
    }

    #[allow(clippy::type_complexity)]
    fn deserialise_records(
        wire_header: &WireHeader,
        buffer: &mut ConsumableBuffer,
    ) -> Result<(Vec<ResourceRecord>, Vec<ResourceRecord>, Vec<ResourceRecord>), ProtocolError>
    {
        let mut answers = Vec::with_capacity(wire_header.ancount.into());
        let mut authority = Vec::with_capacity(wire_header.nscount.into());
        let mut additional = Vec::with_capacity(wire_header.arcount.into());

        for _ in 0..wire_header.ancount {
            answers.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.nscount {
            authority.push(ResourceRecord::deserialise(buffer)?);
        }
        for _ in 0..wire_header.arcount {
            additional.push(ResourceRecord::deserialise(buffer)?);
        }

        Ok((answers, authority, additional))
    }
}

/// The header as it appears on the wire: the `Header` fields plus the
/// four section counts.  The counts only exist during parsing; after
/// that they are the lengths of the section vectors.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct WireHeader {
    pub header: Header,
    pub qdcount: u16,
    pub ancount: u16,
    pub nscount: u16,
    pub arcount: u16,
}

impl WireHeader {
    /// # Errors
    ///
    /// If the header is too short.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, ProtocolError> {
        let id = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;
        let flags = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;
        let qdcount = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;
        let ancount = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;
        let nscount = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;
        let arcount = buffer.next_u16().ok_or(ProtocolError::ShortHeader)?;

        Ok(Self {
            header: Header::from_id_and_flags(id, flags),
            qdcount,
            ancount,
            nscount,
            arcount,
        })
    }
}

impl Question {
    /// # Errors
    ///
    /// If the question cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, ProtocolError> {
        let name = DomainName::deserialise(buffer)?;
        let qtype = RecordType::from(buffer.next_u16().ok_or(ProtocolError::ShortQuestion)?);
        let qclass = RecordClass::from(buffer.next_u16().ok_or(ProtocolError::ShortQuestion)?);

        Ok(Self {
            name,
            qtype,
            qclass,
        })
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the record cannot be parsed.
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, ProtocolError> {
        let name = DomainName::deserialise(buffer)?;
        let rtype = RecordType::from(
            buffer
                .next_u16()
                .ok_or(ProtocolError::ShortResourceRecord)?,
        );
        let rclass = RecordClass::from(
            buffer
                .next_u16()
                .ok_or(ProtocolError::ShortResourceRecord)?,
        );
        let ttl = buffer
            .next_u32()
            .ok_or(ProtocolError::ShortResourceRecord)?;
        let rdlength = buffer
            .next_u16()
            .ok_or(ProtocolError::ShortResourceRecord)?;

        let rdata_start = buffer.position;

        // records which include domain names are deserialised field by
        // field, expanding any pointers; everything else is taken as
        // raw octets.  pointers refer to offsets in the whole message,
        // which is why this keeps reading from `buffer` rather than a
        // window of just the RDATA.
        let rtype_with_data = match rtype {
            RecordType::A => RecordTypeWithData::A {
                address: Ipv4Addr::from(
                    buffer
                        .next_u32()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                ),
            },
            RecordType::NS => RecordTypeWithData::NS {
                nsdname: DomainName::deserialise(buffer)?,
            },
            RecordType::CNAME => RecordTypeWithData::CNAME {
                cname: DomainName::deserialise(buffer)?,
            },
            RecordType::PTR => RecordTypeWithData::PTR {
                ptrdname: DomainName::deserialise(buffer)?,
            },
            RecordType::MX => RecordTypeWithData::MX {
                preference: buffer
                    .next_u16()
                    .ok_or(ProtocolError::ShortResourceRecord)?,
                exchange: DomainName::deserialise(buffer)?,
            },
            RecordType::TXT => {
                let mut strings = Vec::new();
                let rdata_end = rdata_start + usize::from(rdlength);
                while buffer.position < rdata_end {
                    let length = buffer.next_u8().ok_or(ProtocolError::ShortResourceRecord)?;
                    let octets = buffer
                        .take(usize::from(length))
                        .ok_or(ProtocolError::ShortResourceRecord)?;
                    strings.push(Bytes::copy_from_slice(octets));
                }
                RecordTypeWithData::TXT { strings }
            }
            RecordType::AAAA => RecordTypeWithData::AAAA {
                address: Ipv6Addr::new(
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                    buffer
                        .next_u16()
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                ),
            },
            RecordType::SRV => RecordTypeWithData::SRV {
                priority: buffer
                    .next_u16()
                    .ok_or(ProtocolError::ShortResourceRecord)?,
                weight: buffer
                    .next_u16()
                    .ok_or(ProtocolError::ShortResourceRecord)?,
                port: buffer
                    .next_u16()
                    .ok_or(ProtocolError::ShortResourceRecord)?,
                target: DomainName::deserialise(buffer)?,
            },
            RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
                tag,
                octets: Bytes::copy_from_slice(
                    buffer
                        .take(usize::from(rdlength))
                        .ok_or(ProtocolError::ShortResourceRecord)?,
                ),
            },
        };

        if buffer.position == rdata_start + usize::from(rdlength) {
            Ok(Self {
                name,
                rtype_with_data,
                rclass,
                ttl,
            })
        } else {
            Err(ProtocolError::RdataLengthMismatch)
        }
    }
}

impl DomainName {
    /// Read a (possibly compressed) name.
    ///
    /// The read position chases compression pointers through the
    /// message, but the buffer's cursor ends up two octets past the
    /// first pointer encountered, as if the name had simply ended
    /// there.
    ///
    /// Termination is guaranteed by two checks: a pointer must target
    /// an offset strictly before the pointer itself (and outside the
    /// header), and a name may materialise at most 255 octets.
    ///
    /// # Errors
    ///
    /// If the name cannot be parsed.
    #[allow(clippy::missing_panics_doc)]
    pub fn deserialise(buffer: &mut ConsumableBuffer) -> Result<Self, ProtocolError> {
        let mut labels = Vec::<Label>::with_capacity(5);
        let mut len = 0;
        let mut resume_position = None;

        loop {
            let length_position = buffer.position;
            let size = buffer.next_u8().ok_or(ProtocolError::ShortName)?;

            if size == 0 {
                labels.push(Label::new());
                len += 1;
                break;
            } else if usize::from(size) <= LABEL_MAX_LEN {
                let octets = buffer
                    .take(usize::from(size))
                    .ok_or(ProtocolError::ShortName)?;

                len += usize::from(size) + 1;
                if len > DOMAINNAME_MAX_LEN {
                    return Err(ProtocolError::NameTooLong);
                }

                // safe because of the bounds check above
                labels.push(Label::try_from(octets).unwrap());
            } else if size & 0b1100_0000 == 0b1100_0000 {
                let hi = size & 0b0011_1111;
                let lo = buffer.next_u8().ok_or(ProtocolError::ShortName)?;
                let target = usize::from(u16::from_be_bytes([hi, lo]));

                // a pointer may only refer to an earlier occurrence
                // (RFC 1035 section 4.1.4), and never into the header:
                // together with the name length cap this bounds the
                // whole walk.
                if target < HEADER_LEN || target >= length_position {
                    return Err(ProtocolError::PointerOutOfBounds);
                }

                if resume_position.is_none() {
                    resume_position = Some(buffer.position);
                }
                buffer.position = target;
            } else {
                // the top two bits are `01` or `10`, which RFC 1035
                // reserves
                return Err(ProtocolError::BadLabelLength);
            }
        }

        if let Some(position) = resume_position {
            buffer.position = position;
        }

        Ok(DomainName { labels, len })
    }
}

/// Errors encountered when parsing a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ProtocolError {
    /// The message ends before the 12-octet header does.
    ShortHeader,

    /// A question ends with an incomplete field.
    ShortQuestion,

    /// A resource record ends with an incomplete field.
    ShortResourceRecord,

    /// A domain name runs off the end of the message.
    ShortName,

    /// A domain name is over 255 octets in size.
    NameTooLong,

    /// A label length octet has the reserved `01` or `10` top bits.
    BadLabelLength,

    /// A compression pointer targets the header, itself, or a later
    /// part of the message.
    PointerOutOfBounds,

    /// A resource record's RDATA does not match its RDLENGTH.
    RdataLengthMismatch,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::ShortHeader => write!(f, "header too short"),
            ProtocolError::ShortQuestion => write!(f, "question too short"),
            ProtocolError::ShortResourceRecord => write!(f, "resource record too short"),
            ProtocolError::ShortName => write!(f, "domain name too short"),
            ProtocolError::NameTooLong => write!(f, "domain name over 255 octets"),
            ProtocolError::BadLabelLength => write!(f, "label length uses reserved bits"),
            ProtocolError::PointerOutOfBounds => write!(f, "compression pointer out of bounds"),
            ProtocolError::RdataLengthMismatch => write!(f, "rdata does not match rdlength"),
        }
    }
}

impl std::error::Error for ProtocolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A failure to parse a message, along with as much of the message as
/// was readable before things went wrong.
///
/// The question section parses before the record sections, so a
/// response mangled partway through its records still identifies
/// itself here by header *and* question echo; id alone is not enough,
/// since transaction ids wrap and get reused.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MessageError {
    /// The header, if the first 12 octets parsed.
    pub header: Option<Header>,

    /// The questions parsed before the failure.
    pub questions: Vec<Question>,

    /// What went wrong.
    pub error: ProtocolError,
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.header {
            Some(header) => write!(f, "could not parse message {}: {}", header.id, self.error),
            None => write!(f, "could not parse message: {}", self.error),
        }
    }
}

impl std::error::Error for MessageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    pub(crate) position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self {
            octets,
            position: 0,
        }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    fn answer_message(rdata: &[u8], rtype: u16) -> Vec<u8> {
        let mut octets = vec![
            0x12, 0x34, // ID
            0x80, 0x00, // flags: response
            0, 0, // QDCOUNT
            0, 1, // ANCOUNT
            0, 0, // NSCOUNT
            0, 0, // ARCOUNT
            3, b'f', b'o', b'o', 0, // name at offset 12
        ];
        octets.extend_from_slice(&rtype.to_be_bytes());
        octets.extend_from_slice(&[0, 1]); // class IN
        octets.extend_from_slice(&[0, 0, 0, 100]); // TTL
        octets.extend_from_slice(&u16::try_from(rdata.len()).unwrap().to_be_bytes());
        octets.extend_from_slice(rdata);
        octets
    }

    #[test]
    fn deserialise_expands_pointer_in_rdata() {
        // CNAME rdata is a single pointer back to the answer's own
        // name at offset 12
        let octets = answer_message(&[0b1100_0000, 12], 5);
        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(1, message.answers.len());
        assert_eq!(domain("foo."), message.answers[0].name);
        assert_eq!(
            RecordTypeWithData::CNAME {
                cname: domain("foo."),
            },
            message.answers[0].rtype_with_data,
        );
    }

    #[test]
    fn deserialise_checks_section_counts() {
        let octets = answer_message(&[1, 2, 3, 4], 1);
        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(0, message.questions.len());
        assert_eq!(1, message.answers.len());
        assert_eq!(0, message.authority.len());
        assert_eq!(0, message.additional.len());
    }

    #[test]
    fn deserialise_rejects_self_pointer() {
        // qdcount = 1, and the question name at offset 12 points at
        // itself
        let octets = vec![
            0xAB, 0xCD, // ID
            0x80, 0x00, // flags: response
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
            0b1100_0000, 12, // pointer to itself
            0, 1, 0, 1, // qtype, qclass
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(ProtocolError::PointerOutOfBounds, error.error);
        assert_eq!(Some(0xABCD), error.header.map(|h| h.id));
    }

    #[test]
    fn deserialise_rejects_forward_pointer() {
        let octets = vec![
            0, 1, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
            0b1100_0000, 16, // pointer past itself
            0, 1, 0, 1, // qtype, qclass
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(ProtocolError::PointerOutOfBounds, error.error);
    }

    #[test]
    fn deserialise_rejects_pointer_into_header() {
        let octets = vec![
            0, 1, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
            0b1100_0000, 4, // pointer into the header
            0, 1, 0, 1, // qtype, qclass
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(ProtocolError::PointerOutOfBounds, error.error);
    }

    #[test]
    fn deserialise_terminates_on_pointer_loop() {
        // offset 12 holds a one-octet label, offset 14 a pointer back
        // to offset 12: the walk revisits the label until the name
        // length cap trips
        let octets = vec![
            0, 1, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
            1, b'a', // label at offset 12
            0b1100_0000, 12, // pointer at offset 14
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(ProtocolError::NameTooLong, error.error);
    }

    #[test]
    fn deserialise_rejects_reserved_label_bits() {
        let octets = vec![
            0, 1, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
            0b0100_0000, 0, // reserved `01` top bits
            0, 1, 0, 1,
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(ProtocolError::BadLabelLength, error.error);
    }

    #[test]
    fn deserialise_rejects_bad_rdlength() {
        // A records have 4 octets of rdata, not 3
        let octets = answer_message(&[1, 2, 3], 1);

        let error = Message::from_octets(&octets).unwrap_err();
        assert!(matches!(
            error.error,
            ProtocolError::RdataLengthMismatch | ProtocolError::ShortResourceRecord
        ));
        assert_eq!(Some(0x1234), error.header.map(|h| h.id));
    }

    #[test]
    fn deserialise_txt_character_strings() {
        let octets = answer_message(&[3, b'a', b'b', b'c', 1, b'x'], 16);
        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(
            RecordTypeWithData::TXT {
                strings: vec![
                    bytes::Bytes::from_static(b"abc"),
                    bytes::Bytes::from_static(b"x"),
                ],
            },
            message.answers[0].rtype_with_data,
        );
    }

    #[test]
    fn deserialise_txt_rejects_overrunning_string() {
        // the string length claims 5 octets but the rdata holds 1
        let octets = answer_message(&[5, b'a'], 16);

        let error = Message::from_octets(&octets).unwrap_err();
        assert!(matches!(
            error.error,
            ProtocolError::RdataLengthMismatch | ProtocolError::ShortResourceRecord
        ));
    }

    #[test]
    fn deserialise_unknown_type_keeps_octets() {
        let octets = answer_message(&[9, 9, 9], 999);
        let message = Message::from_octets(&octets).unwrap();

        assert_eq!(
            RecordType::from(999),
            message.answers[0].rtype_with_data.rtype()
        );
    }

    #[test]
    fn deserialise_short_header_has_no_header() {
        let error = Message::from_octets(&[0, 1, 2, 3]).unwrap_err();
        assert_eq!(None, error.header);
        assert_eq!(ProtocolError::ShortHeader, error.error);

        let error = Message::from_octets(&[]).unwrap_err();
        assert_eq!(None, error.header);
    }

    #[test]
    fn deserialise_truncated_section_keeps_header() {
        // a valid header claiming one question, then nothing
        let octets = vec![
            0xFE, 0xED, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 0, 0, 0, 0, 0, // other counts
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(Some(0xFEED), error.header.map(|h| h.id));
        assert_eq!(ProtocolError::ShortName, error.error);
    }

    #[test]
    fn deserialise_mangled_records_keep_question_echo() {
        let octets = vec![
            0xBE, 0xEF, // ID
            0x80, 0x00, // flags
            0, 1, // QDCOUNT
            0, 1, // ANCOUNT
            0, 0, 0, 0, // other counts
            3, b'f', b'o', b'o', 0, // question name
            0, 1, 0, 1, // qtype, qclass; the promised answer is missing
        ];

        let error = Message::from_octets(&octets).unwrap_err();
        assert_eq!(Some(0xBEEF), error.header.map(|h| h.id));
        assert_eq!(ProtocolError::ShortName, error.error);
        assert_eq!(
            vec![Question {
                name: domain("foo."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            }],
            error.questions,
        );
    }

    #[test]
    fn roundtrip_arbitrary_resourcerecords() {
        use crate::protocol::serialise::WritableBuffer;
        use rand::Rng;

        let mut rng = rand::rng();
        for _ in 0..100 {
            let mut entropy = vec![0u8; 1024];
            rng.fill(&mut entropy[..]);
            let original = arbitrary_resourcerecord(&entropy);

            // records never start before the header ends, and the
            // decoder rejects compression pointers into the header
            let mut buffer = WritableBuffer::default();
            buffer.write_octets(&[0; 12]);
            original.serialise(&mut buffer).unwrap();

            let mut consumable = ConsumableBuffer::new(&buffer.octets);
            let _ = consumable.take(12);
            let deserialised = ResourceRecord::deserialise(&mut consumable);

            assert_eq!(Ok(original), deserialised);
        }
    }

    #[test]
    fn deserialise_out_of_bounds_never_panics() {
        // truncate a valid message at every possible length
        let octets = answer_message(&[0b1100_0000, 12], 5);
        for length in 0..octets.len() {
            let _ = Message::from_octets(&octets[..length]);
        }
    }
}
