use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Largest frame the assembler will build (Ethernet MTU)
pub const MTU: usize = 1500;

/// Which sample collection a packet was built from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Data,
    Template,
    TemplateOption,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Data, Category::Template, Category::TemplateOption];

    pub fn index(self) -> usize {
        match self {
            Category::Data => 0,
            Category::Template => 1,
            Category::TemplateOption => 2,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Data => write!(f, "data"),
            Category::Template => write!(f, "template"),
            Category::TemplateOption => write!(f, "option-template"),
        }
    }
}

/// A fully framed IPv4/UDP/IPFIX packet.
///
/// The buffer is allocated at MTU capacity and never mutated after assembly,
/// so clones handed to the dispatch channel share it. Only `[0, length)` is
/// meaningful.
#[derive(Debug, Clone)]
pub struct Packet {
    payload: Arc<[u8]>,
    length: usize,
    category: Category,
    source: Ipv4Addr,
}

impl Packet {
    pub fn new(payload: Vec<u8>, length: usize, category: Category, source: Ipv4Addr) -> Self {
        debug_assert!(length <= payload.len());
        Self {
            payload: payload.into(),
            length,
            category,
            source,
        }
    }

    /// The bytes that go on the wire
    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }
}
