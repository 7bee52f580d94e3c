//! Instance size selection.
//!
//! When a blueprint machine names no size, the reconciler picks the cheapest
//! description that satisfies the machine's CPU and RAM ranges and the
//! blueprint's price ceiling. Selection is a pure function over these static
//! tables, so tests (and the reconciler) get identical answers for identical
//! inputs.

use drover_client::blueprint::ResourceRange;
use drover_client::ProviderKind;

/// One bootable instance size as advertised by a provider.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Description {
    pub size: &'static str,
    /// Hourly price in USD.
    pub price: f64,
    /// Memory in GiB.
    pub ram: f64,
    pub cpu: u32,
}

const AMAZON_DESCRIPTIONS: &[Description] = &[
    Description {
        size: "m3.medium",
        price: 0.067,
        ram: 3.75,
        cpu: 1,
    },
    Description {
        size: "m4.large",
        price: 0.1,
        ram: 8.0,
        cpu: 2,
    },
    Description {
        size: "m4.xlarge",
        price: 0.2,
        ram: 16.0,
        cpu: 4,
    },
    Description {
        size: "m4.2xlarge",
        price: 0.4,
        ram: 32.0,
        cpu: 8,
    },
];

const GOOGLE_DESCRIPTIONS: &[Description] = &[
    Description {
        size: "n1-standard-1",
        price: 0.0475,
        ram: 3.75,
        cpu: 1,
    },
    Description {
        size: "n1-standard-2",
        price: 0.095,
        ram: 7.5,
        cpu: 2,
    },
    Description {
        size: "n1-standard-4",
        price: 0.19,
        ram: 15.0,
        cpu: 4,
    },
];

const DIGITAL_OCEAN_DESCRIPTIONS: &[Description] = &[
    Description {
        size: "s-1vcpu-1gb",
        price: 0.007,
        ram: 1.0,
        cpu: 1,
    },
    Description {
        size: "s-2vcpu-2gb",
        price: 0.022,
        ram: 2.0,
        cpu: 2,
    },
    Description {
        size: "s-4vcpu-8gb",
        price: 0.071,
        ram: 8.0,
        cpu: 4,
    },
];

/// The size descriptions a provider advertises. Vagrant sizes are free-form
/// and have no table.
pub fn descriptions(kind: ProviderKind) -> &'static [Description] {
    match kind {
        ProviderKind::Amazon => AMAZON_DESCRIPTIONS,
        ProviderKind::Google => GOOGLE_DESCRIPTIONS,
        ProviderKind::DigitalOcean => DIGITAL_OCEAN_DESCRIPTIONS,
        ProviderKind::Vagrant => &[],
    }
}

/// The cheapest size satisfying the given CPU and RAM ranges and price
/// ceiling (zero meaning unbounded). Ties break by size name, so the answer
/// is deterministic.
pub fn pick_best_size(
    kind: ProviderKind,
    cpu: ResourceRange,
    ram: ResourceRange,
    max_price: f64,
) -> Option<String> {
    descriptions(kind)
        .iter()
        .filter(|d| cpu.accepts(f64::from(d.cpu)) && ram.accepts(d.ram))
        .filter(|d| max_price == 0.0 || d.price <= max_price)
        .min_by(|a, b| {
            a.price
                .partial_cmp(&b.price)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.size.cmp(b.size))
        })
        .map(|d| d.size.to_owned())
}
