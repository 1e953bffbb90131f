use bytes::Bytes;
use rand::Rng;
use std::net::{Ipv4Addr, Ipv6Addr};

use dns_wire::protocol::deserialise::ConsumableBuffer;
use dns_wire::protocol::serialise::WritableBuffer;
use dns_wire::protocol::types::*;

#[test]
fn roundtrip_message() {
    for _ in 0..100 {
        let original = arbitrary_message();
        let octets = original.to_octets().unwrap();
        let deserialised = Message::from_octets(&octets);

        assert_eq!(Ok(original), deserialised.map_err(|e| e.error));
    }
}

#[test]
fn roundtrip_question() {
    for _ in 0..100 {
        let original = arbitrary_question();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer);
        let deserialised = Question::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_resourcerecord() {
    for _ in 0..100 {
        let original = arbitrary_resourcerecord();

        // pad to where a record could actually start: names never
        // precede the 12-octet header, and the decoder rejects
        // compression pointers into it
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
fn roundtrip_domainname() {
    for _ in 0..100 {
        let original = arbitrary_domainname();

        let mut buffer = WritableBuffer::default();
        original.serialise(&mut buffer, true);
        let deserialised = DomainName::deserialise(&mut ConsumableBuffer::new(&buffer.octets));

        assert_eq!(Ok(original), deserialised);
    }
}

#[test]
fn roundtrip_message_with_shared_names() {
    // the same name in several sections forces the encoder to emit
    // compression pointers, which the decoder has to chase
    for _ in 0..100 {
        let name = arbitrary_domainname();
        let target = arbitrary_domainname();

        let mut original = Message::from_question(
            rand::rng().random(),
            Question {
                name: name.clone(),
                qtype: RecordType::A,
                qclass: RecordClass::IN,
            },
        );
        original.answers = vec![
            ResourceRecord {
                name: name.clone(),
                rtype_with_data: RecordTypeWithData::CNAME {
                    cname: target.clone(),
                },
                rclass: RecordClass::IN,
                ttl: 300,
            },
            ResourceRecord {
                name: target.clone(),
                rtype_with_data: RecordTypeWithData::A {
                    address: Ipv4Addr::new(192, 0, 2, 7),
                },
                rclass: RecordClass::IN,
                ttl: 300,
            },
        ];
        original.authority = vec![ResourceRecord {
            name: name.clone(),
            rtype_with_data: RecordTypeWithData::SRV {
                priority: 1,
                weight: 2,
                port: 53,
                target: target.clone(),
            },
            rclass: RecordClass::IN,
            ttl: 300,
        }];

        let octets = original.to_octets().unwrap();

        // header, one question (name + 4), three records (name + 10
        // fixed octets each) with rdata of a name, a 4-octet address,
        // and 6 fixed octets + a name
        let uncompressed_len = 12 + 3 * name.len + 3 * target.len + 4 + 3 * 10 + 4 + 6;
        assert!(octets.len() < uncompressed_len);

        let deserialised = Message::from_octets(&octets);
        assert_eq!(Ok(original), deserialised.map_err(|e| e.error));
    }
}

fn arbitrary_message() -> Message {
    let mut rng = rand::rng();

    let mut questions = Vec::new();
    let mut answers = Vec::new();
    let mut authority = Vec::new();
    let mut additional = Vec::new();

    // keep runtime sane
    for _ in 0..rng.random_range(0..4) {
        questions.push(arbitrary_question());
    }
    for _ in 0..rng.random_range(0..4) {
        answers.push(arbitrary_resourcerecord());
    }
    for _ in 0..rng.random_range(0..4) {
        authority.push(arbitrary_resourcerecord());
    }
    for _ in 0..rng.random_range(0..4) {
        additional.push(arbitrary_resourcerecord());
    }

    Message {
        header: arbitrary_header(),
        questions,
        answers,
        authority,
        additional,
    }
}

fn arbitrary_header() -> Header {
    let mut rng = rand::rng();
    Header {
        id: rng.random(),
        is_response: rng.random(),
        // opcode and rcode are 4-bit fields
        opcode: Opcode::from(rng.random::<u8>() & 0b0000_1111),
        is_authoritative: rng.random(),
        is_truncated: rng.random(),
        recursion_desired: rng.random(),
        recursion_available: rng.random(),
        rcode: Rcode::from(rng.random::<u8>() & 0b0000_1111),
    }
}

fn arbitrary_question() -> Question {
    let mut rng = rand::rng();
    Question {
        name: arbitrary_domainname(),
        qtype: RecordType::from(rng.random::<u16>()),
        qclass: RecordClass::from(rng.random::<u16>()),
    }
}

fn arbitrary_resourcerecord() -> ResourceRecord {
    let mut rng = rand::rng();

    // this should match the `RecordTypeWithData` deserialisation
    let rtype_with_data = match RecordType::from(rng.random::<u16>()) {
        RecordType::A => RecordTypeWithData::A {
            address: Ipv4Addr::from(rng.random::<u32>()),
        },
        RecordType::NS => RecordTypeWithData::NS {
            nsdname: arbitrary_domainname(),
        },
        RecordType::CNAME => RecordTypeWithData::CNAME {
            cname: arbitrary_domainname(),
        },
        RecordType::PTR => RecordTypeWithData::PTR {
            ptrdname: arbitrary_domainname(),
        },
        RecordType::MX => RecordTypeWithData::MX {
            preference: rng.random(),
            exchange: arbitrary_domainname(),
        },
        RecordType::TXT => {
            let mut strings = Vec::new();
            for _ in 0..rng.random_range(0..4) {
                strings.push(arbitrary_octets(rng.random_range(0..64)));
            }
            RecordTypeWithData::TXT { strings }
        }
        RecordType::AAAA => RecordTypeWithData::AAAA {
            address: Ipv6Addr::from(rng.random::<u128>()),
        },
        RecordType::SRV => RecordTypeWithData::SRV {
            priority: rng.random(),
            weight: rng.random(),
            port: rng.random(),
            target: arbitrary_domainname(),
        },
        RecordType::Unknown(tag) => RecordTypeWithData::Unknown {
            tag,
            octets: arbitrary_octets(rng.random_range(0..64)),
        },
    };

    ResourceRecord {
        name: arbitrary_domainname(),
        rtype_with_data,
        rclass: RecordClass::from(rng.random::<u16>()),
        ttl: rng.random(),
    }
}

fn arbitrary_domainname() -> DomainName {
    let mut rng = rand::rng();
    let num_labels = rng.random_range(1..5);
    let mut labels = Vec::with_capacity(num_labels + 1);

    for _ in 0..num_labels {
        let label_len = rng.random_range(1..10);
        let mut octets = Vec::with_capacity(label_len);

        for _ in 0..label_len {
            let mut chr: u8 = rng.random_range(33..126);
            if chr == b'.' {
                chr = b'x';
            }
            octets.push(chr);
        }

        labels.push(Label::try_from(&octets[..]).unwrap());
    }

    labels.push(Label::new());
    DomainName::from_labels(labels).unwrap()
}

fn arbitrary_octets(len: usize) -> Bytes {
    let mut rng = rand::rng();
    let mut out = Vec::with_capacity(len);
    for _ in 0..len {
        out.push(rng.random());
    }
    Bytes::from(out)
}
