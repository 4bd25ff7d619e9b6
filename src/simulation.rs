//! Canned responses served while no MATLAB server is reachable.
use std::sync::Arc;

use rmcp::model::{
    CallToolResult, Content, ErrorCode, ErrorData, JsonObject, ListToolsResult, Tool,
};
use serde_json::{json, Value};

use crate::protocol::JsonRpcMessage;

pub const SIMULATED_CALL_TEXT: &str =
    "Simulated MATLAB response: Connection to actual MATLAB server required for real execution";

/// Answers `tools/list` and `tools/call` deterministically and everything else with
/// method-not-found. Never blocks and never touches the pending table.
pub fn simulated_response(request: &JsonRpcMessage) -> Value {
    let id = json!(request.id);

    match request.method.as_deref() {
        Some("tools/list") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": simulated_tools(),
        }),
        Some("tools/call") => json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": CallToolResult::success(vec![Content::text(SIMULATED_CALL_TEXT)]),
        }),
        _ => {
            let message = format!(
                "Method '{}' not found in simulation mode",
                request.method_name()
            );
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": ErrorData::new(ErrorCode::METHOD_NOT_FOUND, message, None),
            })
        }
    }
}

fn simulated_tools() -> ListToolsResult {
    ListToolsResult {
        tools: vec![
            Tool::new(
                "matlab_execute",
                "Execute MATLAB code and return results",
                schema(json!({
                    "type": "object",
                    "properties": {
                        "code": { "type": "string", "description": "MATLAB code to execute" }
                    },
                    "required": ["code"]
                })),
            ),
            Tool::new(
                "matlab_script",
                "Generate and save MATLAB script",
                schema(json!({
                    "type": "object",
                    "properties": {
                        "filename": { "type": "string", "description": "Script filename" },
                        "content": { "type": "string", "description": "Script content" }
                    },
                    "required": ["filename", "content"]
                })),
            ),
        ],
        ..Default::default()
    }
}

fn schema(value: Value) -> Arc<JsonObject> {
    match value {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;

    fn request(id: Option<RequestId>, method: Option<&str>) -> JsonRpcMessage {
        JsonRpcMessage {
            jsonrpc: Some("2.0".to_string()),
            id,
            method: method.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn tools_list_describes_both_tools() {
        let response = simulated_response(&request(Some("t1".into()), Some("tools/list")));
        assert_eq!(response["jsonrpc"], "2.0");
        assert_eq!(response["id"], "t1");

        let tools = response["result"]["tools"].as_array().unwrap();
        let names: Vec<_> = tools.iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["matlab_execute", "matlab_script"]);

        assert_eq!(tools[0]["inputSchema"]["required"], json!(["code"]));
        assert_eq!(
            tools[1]["inputSchema"]["required"],
            json!(["filename", "content"])
        );
        assert_eq!(
            tools[1]["inputSchema"]["properties"]["content"]["type"],
            "string"
        );
    }

    #[test]
    fn tools_call_returns_placeholder_text() {
        let response = simulated_response(&request(Some(7.into()), Some("tools/call")));
        assert_eq!(response["id"], 7);
        let content = &response["result"]["content"][0];
        assert_eq!(content["type"], "text");
        assert_eq!(content["text"], SIMULATED_CALL_TEXT);
    }

    #[test]
    fn unknown_methods_are_not_found() {
        let response = simulated_response(&request(Some("t2".into()), Some("unknown/thing")));
        assert_eq!(response["id"], "t2");
        assert_eq!(response["error"]["code"], -32601);
        assert_eq!(
            response["error"]["message"],
            "Method 'unknown/thing' not found in simulation mode"
        );
        assert!(response.get("result").is_none());
    }

    #[test]
    fn missing_id_and_method_still_answer() {
        let response = simulated_response(&request(None, None));
        assert!(response["id"].is_null());
        assert_eq!(response["error"]["code"], -32601);
    }
}
