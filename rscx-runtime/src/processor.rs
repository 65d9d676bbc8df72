//! Event I/O processors.
//!
//! A processor owns one `type` of `<send>` and knows how to address sessions
//! with it. The router picks the first registered processor that accepts an
//! event's type and target.

use crate::error::RuntimeError;
use crate::router::DispatchRouter;
use crate::service::{validate_to_parent, PARENT_TARGET};
use async_trait::async_trait;
use rscx_core::{Event, InvokeId, OutgoingEvent, SessionId};

/// Type URI of the built-in processor.
pub const SCXML_PROCESSOR_ID: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

/// Short alias accepted for [`SCXML_PROCESSOR_ID`].
pub const SCXML_PROCESSOR_ALIAS: &str = "scxml";

const SESSION_TARGET_PREFIX: &str = "#_scxml_";

/// Delivers events of one send type.
#[async_trait]
pub trait EventProcessor: Send + Sync {
    fn id(&self) -> &str;

    fn can_handle(&self, event_type: Option<&str>, target: Option<&str>) -> bool;

    /// The address other sessions use to reach `session_id` through this processor.
    fn get_target(&self, session_id: &SessionId) -> String;

    async fn dispatch(
        &self,
        router: &DispatchRouter,
        source: &SessionId,
        event: OutgoingEvent,
    ) -> Result<(), RuntimeError>;
}

/// Session-to-session delivery inside one router.
///
/// Targets:
/// - empty: the sending session
/// - `#_parent`: the session that invoked the sender
/// - `#_scxml_<session id>`: any session
/// - `#_<invoke id>`: a child the sender invoked
#[derive(Debug, Default, Clone, Copy)]
pub struct ScxmlProcessor;

impl ScxmlProcessor {
    pub fn is_scxml_type(event_type: Option<&str>) -> bool {
        matches!(
            event_type,
            None | Some(SCXML_PROCESSOR_ID) | Some(SCXML_PROCESSOR_ALIAS)
        )
    }

    fn resolve(
        &self,
        router: &DispatchRouter,
        source: &SessionId,
        target: &str,
    ) -> Result<SessionId, RuntimeError> {
        if target.is_empty() {
            return Ok(source.clone());
        }
        if let Some(id) = target.strip_prefix(SESSION_TARGET_PREFIX) {
            return Ok(SessionId::new(id));
        }
        if let Some(invoke_id) = target.strip_prefix("#_") {
            return router
                .child_of(source, &InvokeId::new(invoke_id))
                .ok_or_else(|| RuntimeError::UnknownTarget(target.to_string()));
        }
        Err(RuntimeError::UnknownTarget(target.to_string()))
    }
}

#[async_trait]
impl EventProcessor for ScxmlProcessor {
    fn id(&self) -> &str {
        SCXML_PROCESSOR_ID
    }

    fn can_handle(&self, event_type: Option<&str>, target: Option<&str>) -> bool {
        Self::is_scxml_type(event_type)
            && match target {
                None | Some("") => true,
                Some(t) => t.starts_with("#_"),
            }
    }

    fn get_target(&self, session_id: &SessionId) -> String {
        format!("{}{}", SESSION_TARGET_PREFIX, session_id)
    }

    async fn dispatch(
        &self,
        router: &DispatchRouter,
        source: &SessionId,
        event: OutgoingEvent,
    ) -> Result<(), RuntimeError> {
        let target = event.target.clone().unwrap_or_default();

        if target == PARENT_TARGET {
            validate_to_parent(&event)?;
            let link = router.parent_of(source).ok_or_else(|| {
                RuntimeError::UnknownTarget(format!("{} (session {} was not invoked)", target, source))
            })?;
            let delivered = link.to_parent_event(event, SCXML_PROCESSOR_ID);
            return router.deliver(&link.session_id, delivered);
        }

        let destination = self.resolve(router, source, &target)?;
        let mut delivered = Event::external(event.name)
            .with_data(event.data)
            .with_origin(self.get_target(source), SCXML_PROCESSOR_ID);
        delivered.send_id = event.send_id;
        router.deliver(&destination, delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_handle() {
        let p = ScxmlProcessor;
        assert!(p.can_handle(None, None));
        assert!(p.can_handle(Some("scxml"), Some("#_parent")));
        assert!(p.can_handle(Some(SCXML_PROCESSOR_ID), Some("#_scxml_abc")));
        assert!(p.can_handle(None, Some("#_child")));
        assert!(!p.can_handle(Some("http"), None));
        assert!(!p.can_handle(None, Some("http://example.com")));
    }

    #[test]
    fn test_get_target() {
        assert_eq!(
            ScxmlProcessor.get_target(&SessionId::new("abc")),
            "#_scxml_abc"
        );
    }
}
