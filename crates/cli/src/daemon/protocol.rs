use serde::{Deserialize, Serialize};
use ucm_protocol::{Response, SessionId};
use ucm_runtime::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
	/// Run one broker command in this connection's session.
	Command(Command),
	/// Ask for this connection's session id, the source handle for migration.
	SessionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonResponse {
	Ok { response: Response },
	Session { id: SessionId },
	Error { code: String, message: String },
}

impl DaemonResponse {
	pub fn error(err: &ucm_runtime::Error) -> Self {
		Self::Error {
			code: err.code().to_string(),
			message: err.to_string(),
		}
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use ucm_protocol::{ContextId, Opcode};

	use super::*;

	#[test]
	fn command_request_is_flat_on_the_wire() {
		let request: DaemonRequest = serde_json::from_value(json!({
			"type": "command",
			"opcode": 0,
			"input": {"uid": 7, "ps": 262, "qp_type": 2},
			"out_len": 4,
		}))
		.unwrap();

		let DaemonRequest::Command(command) = request else {
			panic!("expected command");
		};
		assert_eq!(command.opcode, Opcode::CreateId.raw());
		assert_eq!(command.out_len, 4);
	}

	#[test]
	fn command_input_defaults_to_null() {
		let request: DaemonRequest =
			serde_json::from_str(r#"{"type":"command","opcode":12,"out_len":0}"#).unwrap();
		assert_eq!(
			request,
			DaemonRequest::Command(Command::new(Opcode::GetEvent, serde_json::Value::Null, 0))
		);
	}

	#[test]
	fn responses_nest_the_broker_response() {
		let ok = DaemonResponse::Ok {
			response: Response::Created { id: ContextId(3) },
		};
		assert_eq!(
			serde_json::to_value(&ok).unwrap(),
			json!({"type": "ok", "response": {"type": "created", "id": 3}})
		);

		let session = DaemonResponse::Session { id: SessionId(9) };
		assert_eq!(serde_json::to_value(&session).unwrap(), json!({"type": "session", "id": 9}));
	}

	#[test]
	fn broker_errors_carry_errno_code() {
		let response = DaemonResponse::error(&ucm_runtime::Error::WouldBlock);
		let DaemonResponse::Error { code, .. } = response else {
			panic!("expected error");
		};
		assert_eq!(code, "EAGAIN");
	}
}
