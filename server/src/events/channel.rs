//! Channel names.
//!
//! Exactly three shapes exist, and the id segment must be a lowercase,
//! hyphenated UUID:
//!
//! - `tenant:{id}:events`
//! - `user:{id}:tasks`
//! - `lead:{id}:timeline`

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use super::error::InvalidChannel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    TenantEvents(Uuid),
    UserTasks(Uuid),
    LeadTimeline(Uuid),
}

impl Channel {
    /// Parse a channel name against the allow-listed grammar.
    pub fn parse(raw: &str) -> Result<Self, InvalidChannel> {
        let mut parts = raw.split(':');
        let (Some(scope), Some(id), Some(suffix), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(InvalidChannel);
        };

        let id = parse_canonical_uuid(id).ok_or(InvalidChannel)?;
        match (scope, suffix) {
            ("tenant", "events") => Ok(Self::TenantEvents(id)),
            ("user", "tasks") => Ok(Self::UserTasks(id)),
            ("lead", "timeline") => Ok(Self::LeadTimeline(id)),
            _ => Err(InvalidChannel),
        }
    }

    /// Scope label used in metrics.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TenantEvents(_) => "tenant",
            Self::UserTasks(_) => "user",
            Self::LeadTimeline(_) => "lead",
        }
    }

    pub const fn id(&self) -> Uuid {
        match self {
            Self::TenantEvents(id) | Self::UserTasks(id) | Self::LeadTimeline(id) => *id,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TenantEvents(id) => write!(f, "tenant:{}:events", id.hyphenated()),
            Self::UserTasks(id) => write!(f, "user:{}:tasks", id.hyphenated()),
            Self::LeadTimeline(id) => write!(f, "lead:{}:timeline", id.hyphenated()),
        }
    }
}

impl FromStr for Channel {
    type Err = InvalidChannel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Accept only the 36-character lowercase hyphenated form.
fn parse_canonical_uuid(raw: &str) -> Option<Uuid> {
    if raw.len() != 36 || raw.bytes().any(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let id = Uuid::try_parse(raw).ok()?;
    (id.hyphenated().to_string() == raw).then_some(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "6f1c2a9e-4b7d-4c1a-9e0f-2d3b4c5d6e7f";

    #[test]
    fn parses_each_shape() {
        let id = Uuid::parse_str(ID).unwrap();
        assert_eq!(
            Channel::parse(&format!("tenant:{ID}:events")),
            Ok(Channel::TenantEvents(id))
        );
        assert_eq!(
            Channel::parse(&format!("user:{ID}:tasks")),
            Ok(Channel::UserTasks(id))
        );
        assert_eq!(
            Channel::parse(&format!("lead:{ID}:timeline")),
            Ok(Channel::LeadTimeline(id))
        );
    }

    #[test]
    fn display_round_trips() {
        let channel = Channel::LeadTimeline(Uuid::parse_str(ID).unwrap());
        assert_eq!(channel.to_string(), format!("lead:{ID}:timeline"));
        assert_eq!(channel.to_string().parse::<Channel>(), Ok(channel));
    }

    #[test]
    fn rejects_anything_off_grammar() {
        let bad = [
            String::new(),
            "tenant:*:events".to_string(),
            format!("tenant:{ID}:*"),
            format!("tenant:{ID}:tasks"),
            format!("user:{ID}:events"),
            format!("tenant:{ID}:events:extra"),
            format!("tenant:{}:events", ID.to_uppercase()),
            format!("tenant:{}:events", ID.replace('-', "")),
            format!("tenant:{{{ID}}}:events"),
            format!("urn:uuid:{ID}"),
            format!(" tenant:{ID}:events"),
            format!("Tenant:{ID}:events"),
            "tenant:not-a-uuid:events".to_string(),
        ];
        for raw in bad {
            assert_eq!(Channel::parse(&raw), Err(InvalidChannel), "{raw:?} should be rejected");
        }
    }
}
