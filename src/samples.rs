use anyhow::{Result, ensure};
use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use std::io;

use crate::packet::Category;

pub const IPFIX_VERSION: u16 = 10;
pub const MESSAGE_HEADER_LEN: usize = 16;
pub const SET_HEADER_LEN: usize = 4;
pub const TEMPLATE_SET_ID: u16 = 2;
pub const OPTION_TEMPLATE_SET_ID: u16 = 3;
pub const DATA_SET_ID_MIN: u16 = 256;

// Fixed so that every run emits byte-identical samples
const EXPORT_TIME: u32 = 1_486_000_000;
const OBSERVATION_DOMAIN_ID: u32 = 1;

/// Information element identifier and its encoded length
#[derive(Debug, Clone, Copy)]
struct FieldSpec {
    id: u16,
    length: u16,
}

const fn field(id: u16, length: u16) -> FieldSpec {
    FieldSpec { id, length }
}

#[derive(Debug)]
struct TemplateDef {
    id: u16,
    scope: &'static [FieldSpec],
    fields: &'static [FieldSpec],
}

impl TemplateDef {
    fn record_len(&self) -> usize {
        self.scope
            .iter()
            .chain(self.fields)
            .map(|f| f.length as usize)
            .sum()
    }
}

const IPV4_FLOW: TemplateDef = TemplateDef {
    id: 256,
    scope: &[],
    fields: &[
        field(8, 4),   // sourceIPv4Address
        field(12, 4),  // destinationIPv4Address
        field(7, 2),   // sourceTransportPort
        field(11, 2),  // destinationTransportPort
        field(4, 1),   // protocolIdentifier
        field(5, 1),   // ipClassOfService
        field(6, 1),   // tcpControlBits
        field(10, 4),  // ingressInterface
        field(14, 4),  // egressInterface
        field(2, 8),   // packetDeltaCount
        field(1, 8),   // octetDeltaCount
        field(152, 8), // flowStartMilliseconds
        field(153, 8), // flowEndMilliseconds
    ],
};

const IPV6_FLOW: TemplateDef = TemplateDef {
    id: 257,
    scope: &[],
    fields: &[
        field(27, 16), // sourceIPv6Address
        field(28, 16), // destinationIPv6Address
        field(7, 2),
        field(11, 2),
        field(4, 1),
        field(2, 8),
        field(1, 8),
        field(150, 4), // flowStartSeconds
        field(151, 4), // flowEndSeconds
    ],
};

const EXPORTER_STATS: TemplateDef = TemplateDef {
    id: 258,
    scope: &[field(144, 4)], // exportingProcessId
    fields: &[
        field(41, 8), // exportedMessageTotalCount
        field(42, 8), // exportedFlowRecordTotalCount
        field(40, 8), // exportedOctetTotalCount
    ],
};

const INTERFACE_SAMPLING: TemplateDef = TemplateDef {
    id: 259,
    scope: &[field(10, 4)],
    fields: &[
        field(50, 4), // samplerRandomInterval
        field(35, 1), // samplingAlgorithm
    ],
};

const IPV4_COMPACT: TemplateDef = TemplateDef {
    id: 260,
    scope: &[],
    fields: &[
        field(8, 4),
        field(12, 4),
        field(7, 2),
        field(11, 2),
        field(4, 1),
        field(2, 8),
        field(1, 8),
    ],
};

/// Canned IPFIX messages, one collection per category
#[derive(Debug, Clone)]
pub struct SampleCatalog {
    data: Vec<Vec<u8>>,
    templates: Vec<Vec<u8>>,
    template_options: Vec<Vec<u8>>,
}

impl SampleCatalog {
    pub fn new(data: Vec<Vec<u8>>, templates: Vec<Vec<u8>>, template_options: Vec<Vec<u8>>) -> Self {
        Self {
            data,
            templates,
            template_options,
        }
    }

    /// Templates 256, 257 and 260, option templates 258 and 259, and data
    /// sets for each of them.
    pub fn builtin() -> Result<Self> {
        let templates = vec![
            encode_template_message(TEMPLATE_SET_ID, &[&IPV4_FLOW, &IPV6_FLOW])?,
            encode_template_message(TEMPLATE_SET_ID, &[&IPV4_COMPACT])?,
        ];

        let template_options = vec![
            encode_template_message(OPTION_TEMPLATE_SET_ID, &[&EXPORTER_STATS])?,
            encode_template_message(OPTION_TEMPLATE_SET_ID, &[&INTERFACE_SAMPLING])?,
        ];

        let mut sequence = 0u32;
        let mut data = Vec::new();
        let messages: [&[(&TemplateDef, u32)]; 4] = [
            &[(&IPV4_FLOW, 8)],
            &[(&IPV6_FLOW, 4)],
            &[(&IPV4_COMPACT, 12)],
            &[(&EXPORTER_STATS, 1), (&INTERFACE_SAMPLING, 2)],
        ];
        for sets in messages {
            data.push(encode_data_message(sequence, sets)?);
            sequence += sets.iter().map(|(_, count)| *count).sum::<u32>();
        }

        let catalog = Self::new(data, templates, template_options);
        for category in Category::ALL {
            ensure!(
                !catalog.samples(category).is_empty(),
                "built-in {} catalog is empty",
                category
            );
        }
        Ok(catalog)
    }

    pub fn samples(&self, category: Category) -> &[Vec<u8>] {
        match category {
            Category::Data => &self.data,
            Category::Template => &self.templates,
            Category::TemplateOption => &self.template_options,
        }
    }
}

/// Builds one IPFIX message; set and message lengths are patched on close
struct MessageWriter {
    buf: Vec<u8>,
    set_start: Option<usize>,
}

impl MessageWriter {
    fn new(sequence: u32) -> io::Result<Self> {
        let mut buf = Vec::with_capacity(512);
        buf.write_u16::<BigEndian>(IPFIX_VERSION)?;
        buf.write_u16::<BigEndian>(0)?;
        buf.write_u32::<BigEndian>(EXPORT_TIME)?;
        buf.write_u32::<BigEndian>(sequence)?;
        buf.write_u32::<BigEndian>(OBSERVATION_DOMAIN_ID)?;
        debug_assert_eq!(buf.len(), MESSAGE_HEADER_LEN);
        Ok(Self {
            buf,
            set_start: None,
        })
    }

    fn begin_set(&mut self, set_id: u16) -> io::Result<()> {
        self.end_set();
        self.set_start = Some(self.buf.len());
        self.buf.write_u16::<BigEndian>(set_id)?;
        self.buf.write_u16::<BigEndian>(0)?;
        Ok(())
    }

    fn end_set(&mut self) {
        if let Some(start) = self.set_start.take() {
            let len = (self.buf.len() - start) as u16;
            BigEndian::write_u16(&mut self.buf[start + 2..start + SET_HEADER_LEN], len);
        }
    }

    fn finish(mut self) -> Vec<u8> {
        self.end_set();
        let len = self.buf.len() as u16;
        BigEndian::write_u16(&mut self.buf[2..4], len);
        self.buf
    }
}

fn encode_template_message(set_id: u16, templates: &[&TemplateDef]) -> Result<Vec<u8>> {
    let mut msg = MessageWriter::new(0)?;
    msg.begin_set(set_id)?;

    for template in templates {
        let field_count = (template.scope.len() + template.fields.len()) as u16;
        msg.buf.write_u16::<BigEndian>(template.id)?;
        msg.buf.write_u16::<BigEndian>(field_count)?;
        if set_id == OPTION_TEMPLATE_SET_ID {
            msg.buf.write_u16::<BigEndian>(template.scope.len() as u16)?;
        }
        for spec in template.scope.iter().chain(template.fields) {
            msg.buf.write_u16::<BigEndian>(spec.id)?;
            msg.buf.write_u16::<BigEndian>(spec.length)?;
        }
    }

    Ok(msg.finish())
}

fn encode_data_message(sequence: u32, sets: &[(&TemplateDef, u32)]) -> Result<Vec<u8>> {
    let mut msg = MessageWriter::new(sequence)?;

    for (template, count) in sets {
        debug_assert!(template.id >= DATA_SET_ID_MIN);
        msg.begin_set(template.id)?;
        for record in 0..*count {
            let start = msg.buf.len();
            for spec in template.scope.iter().chain(template.fields) {
                let value = field_value(spec.id, sequence + record).to_be_bytes();
                msg.buf
                    .extend_from_slice(&value[value.len() - spec.length as usize..]);
            }
            debug_assert_eq!(msg.buf.len() - start, template.record_len());
        }
    }

    Ok(msg.finish())
}

/// Deterministic, plausible value for an information element
fn field_value(id: u16, record: u32) -> u128 {
    let r = record as u128;
    match id {
        8 => u32::from_be_bytes([10, 0, (record >> 8) as u8, (record as u8).wrapping_add(1)]) as u128,
        12 => u32::from_be_bytes([172, 16, 0, (record % 250) as u8 + 1]) as u128,
        27 => 0x2001_0db8_0000_0000_0000_0000_0000_0000 | (r + 1),
        28 => 0x2001_0db8_00ff_0000_0000_0000_0000_0000 | (r + 1),
        7 => 1024 + (r * 7) % 60_000,
        11 => [80u128, 443, 53, 123][record as usize % 4],
        4 => {
            if record % 4 == 2 || record % 4 == 3 {
                17
            } else {
                6
            }
        }
        5 => 0,
        6 => 0x18,
        10 => 1 + r % 4,
        14 => 5 + r % 4,
        2 => 10 + r,
        1 => 1_200 * (10 + r),
        152 => EXPORT_TIME as u128 * 1_000 - 5_000 + r,
        153 => EXPORT_TIME as u128 * 1_000 - 1_000 + r,
        150 => EXPORT_TIME as u128 - 5,
        151 => EXPORT_TIME as u128 - 1,
        144 => 1,
        41 => 5_000 + r,
        42 => 120_000 + r,
        40 => 90_000_000 + r,
        50 => 1_000,
        35 => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Set<'a> {
        id: u16,
        body: &'a [u8],
    }

    fn parse_sets(message: &[u8]) -> Vec<Set<'_>> {
        assert_eq!(BigEndian::read_u16(&message[0..2]), IPFIX_VERSION);
        assert_eq!(BigEndian::read_u16(&message[2..4]) as usize, message.len());

        let mut sets = Vec::new();
        let mut offset = MESSAGE_HEADER_LEN;
        while offset < message.len() {
            let id = BigEndian::read_u16(&message[offset..offset + 2]);
            let len = BigEndian::read_u16(&message[offset + 2..offset + 4]) as usize;
            assert!(len >= SET_HEADER_LEN);
            sets.push(Set {
                id,
                body: &message[offset + SET_HEADER_LEN..offset + len],
            });
            offset += len;
        }
        assert_eq!(offset, message.len(), "set lengths must add up to the message");
        sets
    }

    /// Template id -> record length, read back from encoded (option) template sets
    fn parse_templates(body: &[u8], options: bool) -> HashMap<u16, usize> {
        let mut templates = HashMap::new();
        let mut offset = 0;
        while offset < body.len() {
            let id = BigEndian::read_u16(&body[offset..]);
            let count = BigEndian::read_u16(&body[offset + 2..]) as usize;
            offset += if options { 6 } else { 4 };
            let mut record_len = 0;
            for _ in 0..count {
                record_len += BigEndian::read_u16(&body[offset + 2..]) as usize;
                offset += 4;
            }
            templates.insert(id, record_len);
        }
        templates
    }

    #[test]
    fn test_builtin_catalog_is_well_formed() {
        let catalog = SampleCatalog::builtin().unwrap();

        for sample in catalog.samples(Category::Template) {
            for set in parse_sets(sample) {
                assert_eq!(set.id, TEMPLATE_SET_ID);
            }
        }
        for sample in catalog.samples(Category::TemplateOption) {
            for set in parse_sets(sample) {
                assert_eq!(set.id, OPTION_TEMPLATE_SET_ID);
            }
        }
        for sample in catalog.samples(Category::Data) {
            for set in parse_sets(sample) {
                assert!(set.id >= DATA_SET_ID_MIN);
            }
        }
    }

    #[test]
    fn test_data_sets_match_their_templates() {
        let catalog = SampleCatalog::builtin().unwrap();

        let mut templates = HashMap::new();
        for sample in catalog.samples(Category::Template) {
            for set in parse_sets(sample) {
                templates.extend(parse_templates(set.body, false));
            }
        }
        for sample in catalog.samples(Category::TemplateOption) {
            for set in parse_sets(sample) {
                templates.extend(parse_templates(set.body, true));
            }
        }
        assert_eq!(templates.len(), 5);
        assert_eq!(templates[&256u16], IPV4_FLOW.record_len());

        for sample in catalog.samples(Category::Data) {
            for set in parse_sets(sample) {
                let record_len = templates[&set.id];
                assert!(!set.body.is_empty());
                assert_eq!(set.body.len() % record_len, 0, "set {} has a partial record", set.id);
            }
        }
    }

    #[test]
    fn test_data_sequence_numbers_count_records() {
        let catalog = SampleCatalog::builtin().unwrap();
        let sequences: Vec<u32> = catalog
            .samples(Category::Data)
            .iter()
            .map(|m| BigEndian::read_u32(&m[8..12]))
            .collect();

        assert_eq!(sequences, vec![0, 8, 12, 24]);
    }

    #[test]
    fn test_custom_catalog_lookup() {
        let catalog = SampleCatalog::new(vec![vec![1]], vec![vec![2], vec![3]], vec![]);

        assert_eq!(catalog.samples(Category::Data).len(), 1);
        assert_eq!(catalog.samples(Category::Template).len(), 2);
        assert!(catalog.samples(Category::TemplateOption).is_empty());
    }
}
