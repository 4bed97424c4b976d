//! A full query against an in-process tool server and a scripted model.

use mcp::CallToolResult;
use mcp::testing::StubServer;
use runtime::testing::ScriptedBackend;
use runtime::{Client, ConnectOptions, Error, Message, Part, Role};
use serde_json::json;

fn tool_server() -> StubServer {
    StubServer::new()
        .tool(
            "echo",
            "Echo the given text",
            json!({"type": "object", "properties": {"text": {"type": "string"}}}),
            |args| Ok(CallToolResult::text(args["text"].as_str().unwrap_or_default())),
        )
        .tool("explode", "Always fails", json!({"type": "object"}), |_| {
            Err("kaboom".to_string())
        })
}

async fn connect(server: StubServer, backend: ScriptedBackend) -> Client<ScriptedBackend> {
    match Client::connect_transport(server.start(), backend, ConnectOptions::default()).await {
        Ok(client) => client,
        Err(err) => panic!("connect failed: {err}"),
    }
}

#[tokio::test]
async fn echo_round_trip() {
    let server = tool_server();
    let calls = server.calls();
    let backend = ScriptedBackend::new()
        .reply_tool_call("toolu_1", "echo", json!({"text": "hi"}))
        .reply_text("hi");
    let mut client = connect(server, backend.clone()).await;

    let outcome = client.process_query("say hi").await.unwrap();

    assert_eq!(outcome.text, "hi");
    assert_eq!(outcome.turns, 2);
    let roles: Vec<_> = outcome.transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    match &outcome.transcript[2].parts[..] {
        [Part::ToolResult(result)] => {
            assert_eq!(result.tool_call_id, "toolu_1");
            assert_eq!(result.output, json!("hi"));
        }
        other => panic!("expected one tool result, got {other:?}"),
    }
    assert_eq!(
        *calls.lock().unwrap(),
        [("echo".to_string(), json!({"text": "hi"}))]
    );

    // The second inference call carried the tool result.
    let second = &backend.requests()[1];
    assert_eq!(second.len(), 3);
    assert_eq!(second[0], Message::user("say hi"));

    client.cleanup().await.unwrap();
}

#[tokio::test]
async fn cleanup_twice_is_harmless() {
    let mut client = connect(tool_server(), ScriptedBackend::new()).await;
    client.cleanup().await.unwrap();
    client.cleanup().await.unwrap();
    assert!(client.is_closed());
}

#[tokio::test]
async fn tool_failure_aborts_query_then_cleans_up() {
    let backend = ScriptedBackend::new()
        .reply_tool_call("toolu_1", "explode", json!({}))
        .reply_text("never sent");
    let mut client = connect(tool_server(), backend.clone()).await;

    let err = client.process_query("blow up").await.unwrap_err();
    match err {
        Error::ToolInvocation { name, cause } => {
            assert_eq!(name, "explode");
            assert!(cause.contains("kaboom"));
        }
        other => panic!("expected tool failure, got {other:?}"),
    }
    assert_eq!(backend.requests().len(), 1);
    assert_eq!(client.transcript().len(), 2);

    client.cleanup().await.unwrap();
}

#[tokio::test]
async fn unknown_tool_aborts_query() {
    let backend = ScriptedBackend::new().reply_tool_call("toolu_1", "teleport", json!({}));
    let mut client = connect(tool_server(), backend).await;

    let err = client.process_query("go").await.unwrap_err();
    assert!(matches!(err, Error::ToolInvocation { ref name, .. } if name == "teleport"));
    client.cleanup().await.unwrap();
}

#[tokio::test]
async fn malformed_descriptor_fails_connect() {
    let server = StubServer::new().raw_tool_listing(json!({
        "tools": [{"name": "schemaless", "description": "no inputSchema"}]
    }));

    let result =
        Client::connect_transport(server.start(), ScriptedBackend::new(), ConnectOptions::default())
            .await;
    match result {
        Err(Error::Schema(message)) => assert!(message.contains("schemaless")),
        Err(other) => panic!("expected schema error, got {other:?}"),
        Ok(_) => panic!("connect should fail"),
    }
}

#[tokio::test]
async fn rejected_handshake_fails_connect() {
    let server = StubServer::new().raw_initialize_result(json!({"protocolVersion": 7}));

    let result =
        Client::connect_transport(server.start(), ScriptedBackend::new(), ConnectOptions::default())
            .await;
    assert!(matches!(result, Err(Error::Handshake(_))));
}

#[cfg(unix)]
mod stdio {
    use super::*;
    use mcp::ServerConfig;

    const SERVER: &str = r#"
read line
printf '%s\n' '{"jsonrpc":"2.0","id":1,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-echo"}}}'
read line
read line
printf '%s\n' '{"jsonrpc":"2.0","id":2,"result":{"tools":[{"name":"echo","description":"Echo text","inputSchema":{"type":"object"}}]}}'
read line
printf '%s\n' '{"jsonrpc":"2.0","id":3,"result":{"content":[{"type":"text","text":"hi"}]}}'
read line
"#;

    #[tokio::test]
    async fn query_against_spawned_server() {
        let config = ServerConfig::new("sh").arg("-c").arg(SERVER);
        let backend = ScriptedBackend::new()
            .reply_tool_call("toolu_1", "echo", json!({"text": "hi"}))
            .reply_text("The server said hi.");

        let mut client = match Client::connect(&config, backend).await {
            Ok(client) => client,
            Err(err) => panic!("connect failed: {err}"),
        };
        assert_eq!(client.server_info().unwrap().server_info.name, "sh-echo");

        let outcome = client.process_query("say hi").await.unwrap();
        assert_eq!(outcome.text, "The server said hi.");

        client.cleanup().await.unwrap();
        client.cleanup().await.unwrap();
    }
}
