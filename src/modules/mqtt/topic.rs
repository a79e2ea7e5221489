use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::shared::errors::TopicError;

pub const TOPIC_ROOT: &str = "rentio";
pub const TOPIC_VERSION: &str = "v1";
pub const GATEWAY_SEGMENT: &str = "gw";

/// Channels consumed by the server, in subscription order.
pub const INGEST_CHANNELS: [Channel; 5] = [
    Channel::Evt,
    Channel::State,
    Channel::Tele,
    Channel::Sys,
    Channel::Ack,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Cmd,
    Ack,
    Evt,
    State,
    Tele,
    Sys,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Cmd => "cmd",
            Channel::Ack => "ack",
            Channel::Evt => "evt",
            Channel::State => "state",
            Channel::Tele => "tele",
            Channel::Sys => "sys",
        }
    }
}

impl FromStr for Channel {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cmd" => Ok(Channel::Cmd),
            "ack" => Ok(Channel::Ack),
            "evt" => Ok(Channel::Evt),
            "state" => Ok(Channel::State),
            "tele" => Ok(Channel::Tele),
            "sys" => Ok(Channel::Sys),
            other => Err(TopicError::InvalidChannel(other.to_string())),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured form of a bus topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub tenant: String,
    pub building: String,
    pub gateway: String,
    pub channel: Channel,
    /// Remaining segments joined by `/`; empty when the topic ends at the channel.
    pub subpath: String,
}

impl Address {
    /// Event type derived from the address: the subpath, or the channel name when empty.
    pub fn event_type(&self) -> &str {
        if self.subpath.is_empty() {
            self.channel.as_str()
        } else {
            &self.subpath
        }
    }

    pub fn is_sys_status(&self) -> bool {
        self.channel == Channel::Sys && self.subpath == "status"
    }
}

/// Parses `rentio/v1/{tenant}/{building}/gw/{gateway}/{channel}/{subpath...}`.
///
/// # Examples
/// ```
/// use rentio::modules::mqtt::topic::{parse_topic, Channel};
///
/// let address = parse_topic("rentio/v1/acme/tower-1/gw/gw-07/evt/access/opened").unwrap();
/// assert_eq!(address.channel, Channel::Evt);
/// assert_eq!(address.subpath, "access/opened");
/// ```
pub fn parse_topic(topic: &str) -> Result<Address, TopicError> {
    let parts: Vec<&str> = topic.split('/').collect();

    if parts.len() < 8
        || parts[0] != TOPIC_ROOT
        || parts[1] != TOPIC_VERSION
        || parts[4] != GATEWAY_SEGMENT
    {
        return Err(TopicError::InvalidTopic);
    }

    let channel = parts[6].parse::<Channel>()?;

    Ok(Address {
        tenant: parts[2].to_string(),
        building: parts[3].to_string(),
        gateway: parts[5].to_string(),
        channel,
        subpath: parts[7..].join("/"),
    })
}

/// Subscription filter for one channel across every gateway.
pub fn ingest_filter(channel: Channel) -> String {
    format!(
        "{}/{}/+/+/{}/+/{}/#",
        TOPIC_ROOT, TOPIC_VERSION, GATEWAY_SEGMENT, channel
    )
}

/// Gateway location used to build topics and envelopes on the edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub tenant: String,
    pub building: String,
    pub gateway: String,
}

/// `rentio/v1/{tenant}/{building}/gw/{gateway}` for one gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseTopic(String);

impl BaseTopic {
    pub fn new(location: &Location) -> Self {
        BaseTopic(format!(
            "{}/{}/{}/{}/{}/{}",
            TOPIC_ROOT,
            TOPIC_VERSION,
            location.tenant,
            location.building,
            GATEWAY_SEGMENT,
            location.gateway
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `<base>/<channel>/<suffix>`, or `<base>/<channel>` when `suffix` is empty.
    pub fn topic_for(&self, channel: Channel, suffix: &str) -> String {
        if suffix.is_empty() {
            format!("{}/{}", self.0, channel)
        } else {
            format!("{}/{}/{}", self.0, channel, suffix)
        }
    }

    pub fn status_topic(&self) -> String {
        self.topic_for(Channel::Sys, "status")
    }

    pub fn command_filter(&self) -> String {
        self.topic_for(Channel::Cmd, "#")
    }

    /// Route of a command topic below `<base>/cmd/`, if `topic` is one.
    pub fn command_route<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.0.as_str())
            .and_then(|rest| rest.strip_prefix("/cmd/"))
    }
}

impl fmt::Display for BaseTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
