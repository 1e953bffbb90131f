//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use bytes::{BufMut, BytesMut};
use std::collections::HashMap;

use crate::protocol::types::*;

/// The largest offset a compression pointer can express: pointers are
/// two octets with the top two bits set, leaving 14 bits of offset.
const POINTER_MAX_OFFSET: usize = 0b0011_1111_1111_1111;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn to_octets(&self) -> Result<BytesMut, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than strictly allowed).
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in &self.questions {
            question.serialise(buffer);
        }
        for rr in &self.answers {
            rr.serialise(buffer)?;
        }
        for rr in &self.authority {
            rr.serialise(buffer)?;
        }
        for rr in &self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.id);
        buffer.write_u16(self.flags());
    }
}

impl Question {
    pub fn serialise(&self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer, true);
        self.qtype.serialise(buffer);
        self.qclass.serialise(buffer);
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(&self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer, true);
        self.rtype_with_data.rtype().serialise(buffer);
        self.rclass.serialise(buffer);
        buffer.write_u32(self.ttl);

        // filled in below
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match &self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => nsdname.serialise(buffer, true),
            RecordTypeWithData::CNAME { cname } => cname.serialise(buffer, true),
            RecordTypeWithData::PTR { ptrdname } => ptrdname.serialise(buffer, true),
            RecordTypeWithData::MX {
                preference,
                exchange,
            } => {
                buffer.write_u16(*preference);
                exchange.serialise(buffer, true);
            }
            RecordTypeWithData::TXT { strings } => {
                for string in strings {
                    let length = u8::try_from(string.len()).map_err(|_| Error::CountTooLarge {
                        count: string.len(),
                        bits: u8::BITS,
                    })?;
                    buffer.write_u8(length);
                    buffer.write_octets(string);
                }
            }
            RecordTypeWithData::AAAA { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::SRV {
                priority,
                weight,
                port,
                target,
            } => {
                buffer.write_u16(*priority);
                buffer.write_u16(*weight);
                buffer.write_u16(*port);
                target.serialise(buffer, true);
            }
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(octets),
        }

        // -2 so we don't also include the 2 octets for the rdlength
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    /// Emit a name, using RFC 1035 section 4.1.4 compression if
    /// `compress` is true: at each label position, if the remaining
    /// suffix has already appeared in this message at a
    /// pointer-expressible offset, a two-octet pointer replaces the
    /// rest of the name.  Every emitted suffix is remembered either
    /// way, so later names can point at this one.
    pub fn serialise(&self, buffer: &mut WritableBuffer, compress: bool) {
        let mut suffix = self.normalised_octets();

        for label in &self.labels {
            if label.is_empty() {
                buffer.write_u8(0);
                return;
            }

            if compress {
                if let Some(pointer) = buffer.name_pointer(&suffix) {
                    buffer.write_u16(pointer);
                    return;
                }
            }

            buffer.memoise_name(&suffix);
            buffer.write_u8(label.len());
            buffer.write_octets(label.octets());
            suffix.drain(..usize::from(label.len()) + 1);
        }
    }

    /// The wire form of this name with every octet lowercased: the
    /// form names are compared in, used as the compression map key.
    fn normalised_octets(&self) -> Vec<u8> {
        let mut octets = Vec::with_capacity(self.len);
        for label in &self.labels {
            octets.push(label.len());
            for octet in label.octets() {
                octets.push(octet.to_ascii_lowercase());
            }
        }
        octets
    }
}

impl RecordType {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

impl RecordClass {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_u16(self.into());
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A count does not fit in the desired width.
    CountTooLarge { count: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CountTooLarge { count, bits } => {
                write!(f, "'{count}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.  It
/// carries the name-offset map used for compression; the map lives
/// only as long as the buffer, i.e. for a single message.
pub struct WritableBuffer {
    pub octets: BytesMut,
    name_pointers: HashMap<Vec<u8>, u16>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: BytesMut::with_capacity(512),
            name_pointers: HashMap::new(),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    /// Remember that the name suffix `octets` (in normalised wire
    /// form) is about to be emitted at the current offset.  Suffixes
    /// past the pointer range, and the bare root, are not remembered.
    pub fn memoise_name(&mut self, octets: &[u8]) {
        if octets.len() > 1
            && self.index() <= POINTER_MAX_OFFSET
            && !self.name_pointers.contains_key(octets)
        {
            // safe: index is within the 14-bit pointer range
            let [hi, lo] = u16::try_from(self.index()).unwrap().to_be_bytes();
            self.name_pointers
                .insert(octets.to_vec(), u16::from_be_bytes([hi | 0b1100_0000, lo]));
        }
    }

    /// The encoded pointer to a previously-emitted suffix, if any.
    pub fn name_pointer(&self, octets: &[u8]) -> Option<u16> {
        self.name_pointers.get(octets).copied()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.put_u8(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_octets(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.put_slice(octets);
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
///
/// # Errors
///
/// If the value cannot be converted.
fn usize_to_u16(count: usize) -> Result<u16, Error> {
    if let Ok(t) = u16::try_from(count) {
        Ok(t)
    } else {
        Err(Error::CountTooLarge {
            count,
            bits: u16::BITS,
        })
    }
}
