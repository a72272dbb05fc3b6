use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use super::{ResourceId, ResourceKind};
use crate::error::{ProvisionError, ProvisionResult};

/// IPv4 address block in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, String> {
        if prefix > 32 {
            return Err(format!("prefix length {} exceeds 32", prefix));
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask(prefix));
        if network != addr {
            return Err(format!(
                "{}/{} has host bits set (network address is {})",
                addr, prefix, network
            ));
        }
        Ok(Self { network, prefix })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix as u32)
        }
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    fn first(&self) -> u64 {
        u32::from(self.network) as u64
    }

    fn last(&self) -> u64 {
        self.first() + self.size() - 1
    }

    /// Number of addresses in the block
    pub fn size(&self) -> u64 {
        1u64 << (32 - self.prefix as u32)
    }

    pub fn contains(&self, other: &Ipv4Cidr) -> bool {
        other.prefix >= self.prefix && other.first() >= self.first() && other.last() <= self.last()
    }

    pub fn overlaps(&self, other: &Ipv4Cidr) -> bool {
        self.first() <= other.last() && other.first() <= self.last()
    }

    /// Number of `/new_prefix` blocks that fit in this block
    pub fn capacity(&self, new_prefix: u8) -> u64 {
        if new_prefix < self.prefix || new_prefix > 32 {
            0
        } else {
            1u64 << (new_prefix - self.prefix) as u32
        }
    }

    /// The `index`-th `/new_prefix` block inside this block
    pub fn subnet(&self, new_prefix: u8, index: u64) -> Option<Ipv4Cidr> {
        if index >= self.capacity(new_prefix) {
            return None;
        }
        let step = 1u64 << (32 - new_prefix as u32);
        let start = self.first() + index * step;
        Some(Ipv4Cidr {
            network: Ipv4Addr::from(start as u32),
            prefix: new_prefix,
        })
    }

    /// The `offset`-th address of the block
    pub fn host(&self, offset: u64) -> Option<Ipv4Addr> {
        (offset < self.size()).then(|| Ipv4Addr::from((self.first() + offset) as u32))
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid CIDR '{}': missing prefix length", s))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("invalid CIDR '{}': {}", s, e))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(cidr: Ipv4Cidr) -> Self {
        cidr.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubnetVisibility {
    Public,
    Private,
    Isolated,
}

/// One subnet group, instantiated once per availability zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubnetGroup {
    pub name: String,
    pub visibility: SubnetVisibility,
    pub cidr_mask: u8,
}

/// A concrete subnet after allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub name: String,
    pub zone: String,
    pub visibility: SubnetVisibility,
    pub cidr: Ipv4Cidr,
}

/// Isolated virtual network spread across availability zones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkFabric {
    pub id: ResourceId,
    pub cidr: Ipv4Cidr,
    pub max_zones: u32,
    pub subnet_groups: Vec<SubnetGroup>,
}

impl NetworkFabric {
    /// Network with one public subnet group
    pub fn public(id: &str, cidr: Ipv4Cidr, max_zones: u32, cidr_mask: u8) -> Self {
        Self {
            id: ResourceId::new(ResourceKind::Network, id),
            cidr,
            max_zones,
            subnet_groups: vec![SubnetGroup {
                name: "Public".to_string(),
                visibility: SubnetVisibility::Public,
                cidr_mask,
            }],
        }
    }

    /// Static checks that do not depend on the target account
    pub fn validate(&self) -> ProvisionResult<()> {
        if self.max_zones == 0 {
            return Err(self.invalid("max_zones must be at least 1"));
        }
        if self.subnet_groups.is_empty() {
            return Err(self.invalid("at least one subnet group is required"));
        }
        for group in &self.subnet_groups {
            if group.cidr_mask < self.cidr.prefix() || group.cidr_mask > 28 {
                return Err(self.invalid(&format!(
                    "subnet group '{}' mask /{} must be between /{} and /28",
                    group.name,
                    group.cidr_mask,
                    self.cidr.prefix()
                )));
            }
        }
        Ok(())
    }

    /// Allocate subnets across the given zones.
    ///
    /// Uses `min(max_zones, zones.len())` zones. Blocks are carved out of the
    /// parent range group by group, zone by zone, aligned to each block's own
    /// size, so the result never overlaps and always lies inside the parent.
    pub fn allocate_subnets(&self, zones: &[String]) -> ProvisionResult<Vec<Subnet>> {
        self.validate()?;

        let zone_count = (self.max_zones as usize).min(zones.len());
        if zone_count == 0 {
            return Err(ProvisionError::Quota {
                resource: self.id.clone(),
                message: "no availability zones available in the target region".to_string(),
            });
        }

        let mut subnets: Vec<Subnet> = Vec::new();
        let mut cursor = u32::from(self.cidr.network()) as u64;
        let end = cursor + self.cidr.size();

        for group in &self.subnet_groups {
            let block = 1u64 << (32 - group.cidr_mask as u32);
            for zone in zones.iter().take(zone_count) {
                // Align to the block size
                let start = cursor.div_ceil(block) * block;
                if start + block > end {
                    return Err(ProvisionError::Quota {
                        resource: self.id.clone(),
                        message: format!(
                            "address space {} exhausted allocating /{} for group '{}' in {}",
                            self.cidr, group.cidr_mask, group.name, zone
                        ),
                    });
                }
                let cidr = Ipv4Cidr::new(Ipv4Addr::from(start as u32), group.cidr_mask)
                    .map_err(|e| self.invalid(&e))?;
                subnets.push(Subnet {
                    name: format!("{}Subnet{}", group.name, subnets.len() + 1),
                    zone: zone.clone(),
                    visibility: group.visibility,
                    cidr,
                });
                cursor = start + block;
            }
        }

        check_layout(&self.cidr, &subnets).map_err(|e| self.invalid(&e))?;
        Ok(subnets)
    }

    fn invalid(&self, message: &str) -> ProvisionError {
        ProvisionError::Validation {
            resource: self.id.clone(),
            message: message.to_string(),
        }
    }
}

/// Subnets must lie inside the parent block and must not overlap each other
pub fn check_layout(parent: &Ipv4Cidr, subnets: &[Subnet]) -> Result<(), String> {
    for (i, subnet) in subnets.iter().enumerate() {
        if !parent.contains(&subnet.cidr) {
            return Err(format!("subnet {} lies outside {}", subnet.cidr, parent));
        }
        for other in &subnets[i + 1..] {
            if subnet.cidr.overlaps(&other.cidr) {
                return Err(format!(
                    "subnet {} overlaps subnet {}",
                    subnet.cidr, other.cidr
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(n: usize) -> Vec<String> {
        ["us-east-1a", "us-east-1b", "us-east-1c", "us-east-1d"]
            .iter()
            .take(n)
            .map(|z| z.to_string())
            .collect()
    }

    #[test]
    fn test_cidr_parsing() {
        let cidr: Ipv4Cidr = "10.250.0.0/16".parse().unwrap();
        assert_eq!(cidr.prefix(), 16);
        assert_eq!(cidr.size(), 65536);
        assert!("10.250.1.0/16".parse::<Ipv4Cidr>().is_err());
        assert!("10.250.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.250.0.0/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_cidr_relations() {
        let parent: Ipv4Cidr = "10.250.0.0/16".parse().unwrap();
        let a: Ipv4Cidr = "10.250.0.0/24".parse().unwrap();
        let b: Ipv4Cidr = "10.250.1.0/24".parse().unwrap();
        let outside: Ipv4Cidr = "10.251.0.0/24".parse().unwrap();
        assert!(parent.contains(&a));
        assert!(!parent.contains(&outside));
        assert!(!a.overlaps(&b));
        assert!(parent.overlaps(&a));
        assert_eq!(parent.capacity(24), 256);
        assert_eq!(parent.subnet(24, 1), Some(b));
        assert_eq!(parent.subnet(24, 256), None);
    }

    #[test]
    fn test_public_subnets_across_two_zones() {
        let fabric = NetworkFabric::public("vpc", "10.250.0.0/16".parse().unwrap(), 2, 24);
        let subnets = fabric.allocate_subnets(&zones(3)).unwrap();
        assert_eq!(subnets.len(), 2);
        assert_eq!(subnets[0].cidr.to_string(), "10.250.0.0/24");
        assert_eq!(subnets[0].zone, "us-east-1a");
        assert_eq!(subnets[1].cidr.to_string(), "10.250.1.0/24");
        assert_eq!(subnets[1].zone, "us-east-1b");
        assert!(subnets
            .iter()
            .all(|s| s.visibility == SubnetVisibility::Public));
    }

    #[test]
    fn test_fewer_zones_than_requested() {
        let fabric = NetworkFabric::public("vpc", "10.250.0.0/16".parse().unwrap(), 3, 24);
        assert_eq!(fabric.allocate_subnets(&zones(1)).unwrap().len(), 1);
    }

    #[test]
    fn test_no_zones_is_quota_error() {
        let fabric = NetworkFabric::public("vpc", "10.250.0.0/16".parse().unwrap(), 2, 24);
        let err = fabric.allocate_subnets(&[]).unwrap_err();
        assert!(matches!(err, ProvisionError::Quota { .. }));
        assert_eq!(err.resource().unwrap().to_string(), "network/vpc");
    }

    #[test]
    fn test_address_space_exhaustion_names_network() {
        // A /24 only holds two /25 blocks
        let fabric = NetworkFabric::public("vpc", "10.0.0.0/24".parse().unwrap(), 3, 25);
        let err = fabric.allocate_subnets(&zones(3)).unwrap_err();
        match err {
            ProvisionError::Quota { resource, message } => {
                assert_eq!(resource.to_string(), "network/vpc");
                assert!(message.contains("exhausted"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mixed_group_sizes_stay_aligned_and_disjoint() {
        let mut fabric = NetworkFabric::public("vpc", "10.0.0.0/16".parse().unwrap(), 2, 26);
        fabric.subnet_groups.push(SubnetGroup {
            name: "Private".into(),
            visibility: SubnetVisibility::Private,
            cidr_mask: 24,
        });
        let subnets = fabric.allocate_subnets(&zones(2)).unwrap();
        assert_eq!(subnets.len(), 4);
        // Two /26 blocks first, then the /24 blocks start on a /24 boundary
        assert_eq!(subnets[2].cidr.to_string(), "10.0.1.0/24");
        assert!(check_layout(&fabric.cidr, &subnets).is_ok());
    }

    #[test]
    fn test_invalid_mask_rejected() {
        let fabric = NetworkFabric::public("vpc", "10.250.0.0/16".parse().unwrap(), 2, 8);
        assert!(matches!(
            fabric.validate(),
            Err(ProvisionError::Validation { .. })
        ));
    }

    #[test]
    fn test_check_layout_detects_overlap() {
        let parent: Ipv4Cidr = "10.0.0.0/16".parse().unwrap();
        let subnet = |cidr: &str| Subnet {
            name: "s".into(),
            zone: "z".into(),
            visibility: SubnetVisibility::Public,
            cidr: cidr.parse().unwrap(),
        };
        assert!(check_layout(&parent, &[subnet("10.0.0.0/24"), subnet("10.0.0.128/25")]).is_err());
        assert!(check_layout(&parent, &[subnet("10.1.0.0/24")]).is_err());
    }
}
