//! Tag vocabulary and tag construction.
//!
//! Tags are the orchestrator's only persistent index. Each resource carries
//! the reservation id, an isolation marker and a role marker, and lookups
//! run against those tags rather than any local state.

use aws_sdk_ec2::types::{Filter, Tag};

use crate::context::ReservationContext;

/// Display-name tag key.
pub const NAME_TAG_KEY: &str = "Name";
/// Reservation ownership tag key. Primary rediscovery index.
pub const RESERVATION_TAG_KEY: &str = "ReservationId";
/// Isolation marker tag key.
pub const ISOLATION_TAG_KEY: &str = "Isolation";
/// Role marker tag key (subnet visibility, security group role, and so on).
pub const TYPE_TAG_KEY: &str = "Type";
/// Requesting-user attribution tag key.
pub const OWNER_TAG_KEY: &str = "Owner";
/// Blueprint attribution tag key.
pub const BLUEPRINT_TAG_KEY: &str = "Blueprint";

/// The only isolation marker value the orchestrator writes.
pub const ISOLATION_EXCLUSIVE: &str = "Exclusive";

/// Role marker values written to the `Type` tag.
pub mod role {
    /// Reservation default security group.
    pub const DEFAULT: &str = "Default";
    /// Reservation isolated security group.
    pub const ISOLATED: &str = "Isolated";
    /// Internet-routable subnet.
    pub const PUBLIC: &str = "Public";
    /// Subnet without a default route to the internet gateway.
    pub const PRIVATE: &str = "Private";
    /// Requester-defined custom route table.
    pub const CUSTOM: &str = "Custom";
    /// Internet gateway attached to the sandbox VPC.
    pub const INTERNET_GATEWAY: &str = "InternetGateway";
    /// Peering connection to the management network.
    pub const PEERING: &str = "Peering";
}

/// An ordered set of tag key/value pairs destined for one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagSet {
    pairs: Vec<(String, String)>,
}

impl TagSet {
    /// The standard tags every reservation resource carries: display name,
    /// reservation id, isolation marker and attribution.
    pub fn for_resource(ctx: &ReservationContext, name: &str) -> Self {
        let mut set = Self::default();
        set.push(NAME_TAG_KEY, name);
        set.push(RESERVATION_TAG_KEY, &ctx.reservation_id);
        set.push(ISOLATION_TAG_KEY, ISOLATION_EXCLUSIVE);
        if !ctx.owner.is_empty() {
            set.push(OWNER_TAG_KEY, &ctx.owner);
        }
        if !ctx.blueprint.is_empty() {
            set.push(BLUEPRINT_TAG_KEY, &ctx.blueprint);
        }
        set
    }

    /// Add a role marker under the `Type` key.
    pub fn with_role(mut self, role: &str) -> Self {
        self.push(TYPE_TAG_KEY, role);
        self
    }

    /// Append an arbitrary pair.
    pub fn push(&mut self, key: &str, value: &str) {
        self.pairs.push((key.to_string(), value.to_string()));
    }

    /// The raw pairs, in insertion order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.pairs
    }

    /// Value of the display-name tag, when present.
    pub fn name(&self) -> Option<&str> {
        self.value_of(NAME_TAG_KEY)
    }

    /// Value for an arbitrary key, when present.
    pub fn value_of(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Render as EC2 `Tag` values for create-time tag specifications and
    /// `create_tags` calls.
    pub fn to_ec2_tags(&self) -> Vec<Tag> {
        self.pairs
            .iter()
            .map(|(k, v)| Tag::builder().key(k).value(v).build())
            .collect()
    }
}

/// EC2 filter matching resources tagged with the given reservation id.
pub fn reservation_filter(reservation_id: &str) -> Filter {
    tag_filter(RESERVATION_TAG_KEY, reservation_id)
}

/// EC2 filter matching resources by display name tag.
pub fn name_filter(name: &str) -> Filter {
    tag_filter(NAME_TAG_KEY, name)
}

/// EC2 filter matching an arbitrary tag key/value pair.
pub fn tag_filter(key: &str, value: &str) -> Filter {
    Filter::builder()
        .name(format!("tag:{}", key))
        .values(value)
        .build()
}

/// EC2 filter on a non-tag attribute, such as `vpc-id`.
pub fn attribute_filter(name: &str, value: &str) -> Filter {
    Filter::builder().name(name).values(value).build()
}

/// Extract the display name from a resource's tag list.
pub fn name_of(tags: &[Tag]) -> Option<String> {
    tags.iter()
        .find(|t| t.key() == Some(NAME_TAG_KEY))
        .and_then(|t| t.value().map(str::to_string))
}

/// Extract an arbitrary tag value from a resource's tag list.
pub fn tag_value(tags: &[Tag], key: &str) -> Option<String> {
    tags.iter()
        .find(|t| t.key() == Some(key))
        .and_then(|t| t.value().map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_tags_carry_identity_and_isolation() {
        let ctx = ReservationContext::new("r-9").with_owner("kim");
        let set = TagSet::for_resource(&ctx, "VPC Reservation: r-9").with_role(role::DEFAULT);

        assert_eq!(set.name(), Some("VPC Reservation: r-9"));
        assert_eq!(set.value_of(RESERVATION_TAG_KEY), Some("r-9"));
        assert_eq!(set.value_of(ISOLATION_TAG_KEY), Some(ISOLATION_EXCLUSIVE));
        assert_eq!(set.value_of(OWNER_TAG_KEY), Some("kim"));
        assert_eq!(set.value_of(TYPE_TAG_KEY), Some(role::DEFAULT));
        assert_eq!(set.value_of(BLUEPRINT_TAG_KEY), None);
    }

    #[test]
    fn filters_address_tag_namespace() {
        let filter = reservation_filter("r-9");
        assert_eq!(filter.name(), Some("tag:ReservationId"));
        assert_eq!(filter.values(), &["r-9".to_string()]);

        let filter = attribute_filter("vpc-id", "vpc-123");
        assert_eq!(filter.name(), Some("vpc-id"));
    }
}
