//! Wire types exchanged with clients: one JSON object per text frame.

use serde::{Deserialize, Serialize};

use crate::game::components::{Entity, Ping, Token};

/// A client-submitted batch of updates, applied as one transactional
/// mutation of the room.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Request {
    pub request_id: String,
    pub updates: Vec<Update>,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Update {
    Create { data: Token },
    Update { data: Token },
    Delete { data: String },
    Ping { data: Ping },
}

/// Server-to-client message. Serialized with null fields omitted; the
/// variants simply don't carry fields they never populate.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Response {
    /// First message on every connection: the current room contents.
    Connected { data: Vec<Entity> },
    /// Full entity snapshot after a committed mutation, not a delta, so
    /// clients converge from any received response.
    State {
        data: Vec<Entity>,
        request_id: String,
    },
    Error {
        data: String,
        request_id: String,
        session_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::components::{TokenContents, TokenKind};

    #[test]
    fn requests_parse_all_actions() {
        let request: Request = serde_json::from_str(
            r#"{
                "request_id": "r1",
                "updates": [
                    {"action": "create", "data": {
                        "id": "t1", "type": "character",
                        "contents": {"type": "icon", "icon_id": "axe"},
                        "start_x": 0, "start_y": 0, "start_z": 0,
                        "end_x": 1, "end_y": 1, "end_z": 1
                    }},
                    {"action": "delete", "data": "t0"},
                    {"action": "ping", "data": {"id": "p1", "x": 2, "y": 3}}
                ]
            }"#,
        )
        .expect("valid request");

        assert_eq!(request.request_id, "r1");
        assert_eq!(request.updates.len(), 3);
        match &request.updates[0] {
            Update::Create { data } => {
                assert_eq!(data.kind, TokenKind::Character);
                assert_eq!(
                    data.contents,
                    TokenContents::Icon {
                        icon_id: "axe".to_owned()
                    }
                );
            }
            other => panic!("expected a create, got {other:?}"),
        }
        assert_eq!(
            request.updates[1],
            Update::Delete {
                data: "t0".to_owned()
            }
        );
    }

    #[test]
    fn unknown_actions_are_rejected() {
        let result: Result<Request, _> = serde_json::from_str(
            r#"{"request_id": "r1", "updates": [{"action": "explode", "data": "t0"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn responses_omit_absent_fields() {
        let frame =
            serde_json::to_string(&Response::Connected { data: Vec::new() }).expect("serializable");
        assert_eq!(frame, r#"{"type":"connected","data":[]}"#);

        let frame = serde_json::to_string(&Response::State {
            data: vec![Entity::Ping(Ping {
                id: "p1".to_owned(),
                x: 1,
                y: 2,
            })],
            request_id: "r1".to_owned(),
        })
        .expect("serializable");
        assert_eq!(
            frame,
            r#"{"type":"state","data":[{"id":"p1","x":1,"y":2}],"request_id":"r1"}"#
        );
    }

    #[test]
    fn uncolored_tokens_serialize_without_color() {
        let token = Token {
            id: "t1".to_owned(),
            kind: TokenKind::Floor,
            contents: TokenContents::Text {
                text: "pit".to_owned(),
            },
            start_x: 0,
            start_y: 0,
            start_z: 0,
            end_x: 1,
            end_y: 1,
            end_z: 1,
            color_rgb: None,
        };
        let frame = serde_json::to_string(&token).expect("serializable");
        assert!(!frame.contains("color_rgb"));
    }
}
