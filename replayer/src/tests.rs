use super::*;

use hvkd::machine::{Machine, MachineImage};
use hvkd_commands::SessionConfig;

use pretty_assertions::assert_eq;

const DEMO_MACHINE: &str = include_str!("../../demos/machine.json");
const DEMO_SCRIPT: &str = include_str!("../../demos/script.json");

fn demo_session() -> Session<Machine> {
    let machine = MachineImage::from_json(DEMO_MACHINE)
        .unwrap()
        .build()
        .unwrap();
    Session::new(machine, SessionConfig::default())
}

fn response(status: Status, payload: Value) -> Response {
    Response { status, payload }
}

#[test]
fn demo_script_replays() {
    let session = demo_session();
    let script: Vec<Request> = serde_json::from_str(DEMO_SCRIPT).unwrap();
    let responses = replay(&session, &script).unwrap();

    let expected = vec![
        Response::status(Status::Success),
        response(
            Status::Success,
            json!({ "data": [72, 137, 92, 36, 8, 87, 144, 144], "address_mode": "unknown" }),
        ),
        response(
            Status::Success,
            json!({ "data": [72, 137, 92, 36, 8, 204, 144, 144], "address_mode": "bit64" }),
        ),
        response(
            Status::Success,
            json!({ "data": [221, 204, 187, 170], "address_mode": "bit32" }),
        ),
        response(Status::Success, json!({ "matched": 1, "results": [4104] })),
        response(
            Status::ResultBufferFull,
            json!({ "matched": 1, "results": [4096] }),
        ),
        response(Status::Success, json!({ "bytes_written": 2 })),
        Response::status(Status::InvalidParameter),
        response(
            Status::Success,
            json!({ "values": [0xffff_8000_0000_0000u64, 0xffff_8000_0000_0000u64] }),
        ),
        Response::status(Status::Success),
        Response::status(Status::UnknownPreactivation),
        Response::status(Status::Success),
        Response::status(Status::InvalidParameter),
    ];
    assert_eq!(expected, responses);

    let mut patched = [0u8; 4];
    session
        .platform()
        .read_virtual(4, 0x1008, &mut patched)
        .unwrap();
    assert_eq!([1, 2, 0xbb, 0xaa], patched);
    assert!(!session.platform().exec_trap_initialized());
}

#[test]
fn context_defaults_to_normal() {
    let request: Request = serde_json::from_str(
        r#"{ "op": "read_memory", "pid": 4, "address": 4096, "size": 1, "kind": "physical" }"#,
    )
    .unwrap();
    match request {
        Request::ReadMemory(InContext { context, request }) => {
            assert_eq!(ExecutionContext::Normal, context);
            assert_eq!(hvkd::MemoryKind::Physical, request.kind);
            assert!(!request.get_address_mode);
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[test]
fn unknown_operation_is_rejected() {
    let script = r#"[{ "op": "reboot" }]"#;
    assert!(serde_json::from_str::<Vec<Request>>(script).is_err());
}

#[test]
fn interactive_search_reports_each_match() {
    let session = demo_session();
    let request: Request = serde_json::from_str(
        r#"{
            "op": "search_memory_interactive", "pid": 4, "address": 4096, "length": 8192,
            "kind": "virtual", "chunk_size": 1, "count": 1, "pattern": [204]
        }"#,
    )
    .unwrap();

    let response = execute(&session, &request).unwrap();
    assert_eq!(
        json!({ "matched": 2, "reported": [4101, 4105] }),
        response.payload
    );
    assert_eq!(Status::Success, response.status);
}

#[test]
fn null_payload_is_omitted() {
    let text = serde_json::to_string(&Response::status(Status::NotContiguous)).unwrap();
    assert_eq!(r#"{"status":"not_contiguous"}"#, text);
}
