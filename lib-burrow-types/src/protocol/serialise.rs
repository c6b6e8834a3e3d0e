//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.
//!
//! Compression pointers are never emitted: names are always written
//! in full.  The decoder accepts both forms.

use crate::protocol::types::*;

impl Message {
    /// # Errors
    ///
    /// If the message is invalid (the `Message` type permits more
    /// states than the wire format does).
    pub fn into_octets(self) -> Result<Vec<u8>, Error> {
        let mut buffer = WritableBuffer::default();
        self.serialise(&mut buffer)?;
        Ok(buffer.octets)
    }

    /// # Errors
    ///
    /// If a section is too long for its 16-bit count field.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        let qdcount = usize_to_u16(self.questions.len())?;
        let ancount = usize_to_u16(self.answers.len())?;
        let nscount = usize_to_u16(self.authority.len())?;
        let arcount = usize_to_u16(self.additional.len())?;

        self.header.serialise(buffer);
        buffer.write_u16(qdcount);
        buffer.write_u16(ancount);
        buffer.write_u16(nscount);
        buffer.write_u16(arcount);

        for question in self.questions {
            question.serialise(buffer);
        }
        for rr in self.answers {
            rr.serialise(buffer)?;
        }
        for rr in self.authority {
            rr.serialise(buffer)?;
        }
        for rr in self.additional {
            rr.serialise(buffer)?;
        }

        Ok(())
    }
}

impl Header {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        // octet 1
        let flag_qr = if self.is_response { HEADER_MASK_QR } else { 0 };
        let field_opcode = HEADER_MASK_OPCODE & (u8::from(self.opcode) << HEADER_OFFSET_OPCODE);
        let flag_aa = if self.is_authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
        let flag_tc = if self.is_truncated { HEADER_MASK_TC } else { 0 };
        let flag_rd = if self.recursion_desired {
            HEADER_MASK_RD
        } else {
            0
        };
        // octet 2 (the Z bits stay zero)
        let flag_ra = if self.recursion_available {
            HEADER_MASK_RA
        } else {
            0
        };
        let field_rcode = HEADER_MASK_RCODE & (u8::from(self.rcode) << HEADER_OFFSET_RCODE);

        buffer.write_u16(self.id);
        buffer.write_u8(flag_qr | field_opcode | flag_aa | flag_tc | flag_rd);
        buffer.write_u8(flag_ra | field_rcode);
    }
}

impl Question {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        self.name.serialise(buffer);
        buffer.write_u16(self.qtype.into());
        buffer.write_u16(self.qclass.into());
    }
}

impl ResourceRecord {
    /// # Errors
    ///
    /// If the RDATA is too long.
    pub fn serialise(self, buffer: &mut WritableBuffer) -> Result<(), Error> {
        self.name.serialise(buffer);
        buffer.write_u16(self.rtype_with_data.rtype().into());
        buffer.write_u16(self.rclass.into());
        buffer.write_u32(self.ttl);

        // RDLENGTH is only known once the RDATA has been written;
        // leave a hole and patch it after.
        let rdlength_index = buffer.index();
        buffer.write_u16(0);

        match self.rtype_with_data {
            RecordTypeWithData::A { address } => buffer.write_octets(&address.octets()),
            RecordTypeWithData::NS { nsdname } => buffer.write_octets(&nsdname.octets),
            RecordTypeWithData::CNAME { cname } => buffer.write_octets(&cname.octets),
            RecordTypeWithData::SOA { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::PTR { ptrdname } => buffer.write_octets(&ptrdname.octets),
            RecordTypeWithData::MX { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::TXT { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::AAAA { octets } => buffer.write_octets(&octets),
            RecordTypeWithData::Unknown { octets, .. } => buffer.write_octets(&octets),
        }

        // -2 so the patch does not count its own field
        let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
        let [hi, lo] = rdlength.to_be_bytes();
        buffer.octets[rdlength_index] = hi;
        buffer.octets[rdlength_index + 1] = lo;

        Ok(())
    }
}

impl DomainName {
    pub fn serialise(self, buffer: &mut WritableBuffer) {
        buffer.write_octets(&self.octets);
    }
}

/// Errors encountered when serialising a message.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Error {
    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for Error {}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(512),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.octets.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        self.octets.extend_from_slice(octets);
    }
}

fn usize_to_u16(counter: usize) -> Result<u16, Error> {
    u16::try_from(counter).map_err(|_| Error::CounterTooLarge {
        counter,
        bits: u16::BITS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::test_util::*;

    #[test]
    #[rustfmt::skip]
    fn serialise_sets_rdlength() {
        let mut buf = WritableBuffer::default();

        let rr = cname_record("www.gumpe.", "server2.gumpe.");
        rr.serialise(&mut buf).unwrap();

        assert_eq!(
            vec![
                // NAME
                3, b'w', b'w', b'w',
                5, b'g', b'u', b'm', b'p', b'e', 0,
                // TYPE
                0, 5,
                // CLASS
                0, 1,
                // TTL
                0, 0, 0b0000_0001, 0b0010_1100, // 300
                // RDLENGTH
                0, 15,
                // RDATA
                7, b's', b'e', b'r', b'v', b'e', b'r', b'2',
                5, b'g', b'u', b'm', b'p', b'e', 0,
            ],
            buf.octets,
        );
    }

    #[test]
    fn serialise_header_flag_bits() {
        let query = Message::from_question(
            0x0102,
            Question {
                name: domain("gumpe."),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        let mut response = query.make_response();
        response.header.is_authoritative = true;
        response.header.rcode = Rcode::NameError;

        let octets = response.into_octets().unwrap();

        assert_eq!(0x01, octets[0]);
        assert_eq!(0x02, octets[1]);
        // QR set, opcode 0, AA set, TC clear, RD clear
        assert_eq!(0b1000_0100, octets[2]);
        // RA set, Z zero, RCODE 3
        assert_eq!(0b1000_0011, octets[3]);
    }
}
