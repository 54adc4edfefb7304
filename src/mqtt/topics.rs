//! Topic layout shared with the controller firmware
//!
//! All topics live under a configurable prefix (`cnc-granel` by default):
//!
//! | Topic | Direction |
//! |---|---|
//! | `{prefix}/discovery` | device → server |
//! | `{prefix}/disconnected` | device → server |
//! | `{prefix}/server/online` | server → devices |
//! | `{prefix}/{uuid}/config` | server → device |
//! | `{prefix}/{uuid}/config/feedback` | device → server |
//! | `{prefix}/{uuid}/component/{id}/command` | server → device |
//! | `{prefix}/{uuid}/component/{id}/feedback` | device → server |
//! | `{prefix}/{uuid}/ping` | server → device |
//! | `{prefix}/{uuid}/pong` | device → server |

/// Topic builder bound to a prefix
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
}

impl Topics {
    #[must_use]
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn discovery(&self) -> String {
        format!("{}/discovery", self.prefix)
    }

    #[must_use]
    pub fn disconnected(&self) -> String {
        format!("{}/disconnected", self.prefix)
    }

    #[must_use]
    pub fn server_online(&self) -> String {
        format!("{}/server/online", self.prefix)
    }

    #[must_use]
    pub fn config(&self, uuid: &str) -> String {
        format!("{}/{uuid}/config", self.prefix)
    }

    #[must_use]
    pub fn config_feedback(&self, uuid: &str) -> String {
        format!("{}/{uuid}/config/feedback", self.prefix)
    }

    #[must_use]
    pub fn command(&self, uuid: &str, component_id: &str) -> String {
        format!("{}/{uuid}/component/{component_id}/command", self.prefix)
    }

    #[must_use]
    pub fn command_feedback(&self, uuid: &str, component_id: &str) -> String {
        format!("{}/{uuid}/component/{component_id}/feedback", self.prefix)
    }

    #[must_use]
    pub fn ping(&self, uuid: &str) -> String {
        format!("{}/{uuid}/ping", self.prefix)
    }

    #[must_use]
    pub fn pong(&self, uuid: &str) -> String {
        format!("{}/{uuid}/pong", self.prefix)
    }

    /// Classify a topic the server is subscribed to
    #[must_use]
    pub fn parse<'a>(&self, topic: &'a str) -> Option<InboundTopic<'a>> {
        let rest = topic.strip_prefix(self.prefix.as_str())?.strip_prefix('/')?;
        let parts: Vec<&str> = rest.split('/').collect();

        match parts.as_slice() {
            ["discovery"] => Some(InboundTopic::Discovery),
            ["disconnected"] => Some(InboundTopic::Disconnected),
            [uuid, "pong"] if !uuid.is_empty() => Some(InboundTopic::Pong { uuid }),
            [uuid, "config", "feedback"] if !uuid.is_empty() => {
                Some(InboundTopic::ConfigFeedback { uuid })
            }
            [uuid, "component", component_id, "feedback"]
                if !uuid.is_empty() && !component_id.is_empty() =>
            {
                Some(InboundTopic::CommandFeedback { uuid, component_id })
            }
            _ => None,
        }
    }
}

/// Topics the server consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundTopic<'a> {
    Discovery,
    Disconnected,
    Pong { uuid: &'a str },
    ConfigFeedback { uuid: &'a str },
    CommandFeedback { uuid: &'a str, component_id: &'a str },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics() -> Topics {
        Topics::new("cnc-granel")
    }

    #[test]
    fn builds_device_topics() {
        let t = topics();
        assert_eq!(t.ping("abc"), "cnc-granel/abc/ping");
        assert_eq!(
            t.command("abc", "led1"),
            "cnc-granel/abc/component/led1/command"
        );
        assert_eq!(t.config_feedback("abc"), "cnc-granel/abc/config/feedback");
        assert_eq!(t.server_online(), "cnc-granel/server/online");
    }

    #[test]
    fn parses_inbound_topics() {
        let t = topics();
        assert_eq!(t.parse("cnc-granel/discovery"), Some(InboundTopic::Discovery));
        assert_eq!(
            t.parse("cnc-granel/disconnected"),
            Some(InboundTopic::Disconnected)
        );
        assert_eq!(
            t.parse("cnc-granel/abc/pong"),
            Some(InboundTopic::Pong { uuid: "abc" })
        );
        assert_eq!(
            t.parse("cnc-granel/abc/config/feedback"),
            Some(InboundTopic::ConfigFeedback { uuid: "abc" })
        );
        assert_eq!(
            t.parse("cnc-granel/abc/component/led1/feedback"),
            Some(InboundTopic::CommandFeedback {
                uuid: "abc",
                component_id: "led1"
            })
        );
    }

    #[test]
    fn rejects_foreign_and_outbound_topics() {
        let t = topics();
        assert_eq!(t.parse("other/discovery"), None);
        assert_eq!(t.parse("cnc-granel/abc/ping"), None);
        assert_eq!(t.parse("cnc-granel/abc/config"), None);
        assert_eq!(t.parse("cnc-granel//pong"), None);
        assert_eq!(t.parse("cnc-graneldiscovery"), None);
    }
}
