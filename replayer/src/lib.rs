//! Runs scripted debugger requests against a session, one response per
//! request.

#[cfg(test)]
mod tests;

use hvkd::Platform;
use hvkd_commands::memory::{EditMemoryRequest, ReadMemoryRequest};
use hvkd_commands::msr::MsrRequest;
use hvkd_commands::prealloc::{PreactivateRequest, PreallocRequest};
use hvkd_commands::search::SearchMemoryRequest;
use hvkd_commands::{ExecutionContext, Result, Session, Status};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use log::debug;

#[derive(Debug, Clone, Deserialize)]
pub struct InContext<T> {
    #[serde(default)]
    pub context: ExecutionContext,
    #[serde(flatten)]
    pub request: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    ReadMemory(InContext<ReadMemoryRequest>),
    EditMemory(InContext<EditMemoryRequest>),
    SearchMemory(InContext<SearchMemoryRequest>),
    SearchMemoryInteractive(SearchMemoryRequest),
    Msr(MsrRequest),
    Prealloc(PreallocRequest),
    Preactivate(PreactivateRequest),
    /// Records a byte replaced by a trap. The trap itself is not written.
    InstallShadow { address: u64, previous_byte: u8 },
    RemoveShadow { address: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub status: Status,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Response {
    fn status(status: Status) -> Self {
        Self {
            status,
            payload: Value::Null,
        }
    }
}

fn respond<T, F>(result: Result<T>, payload: F) -> serde_json::Result<Response>
where
    F: FnOnce(T) -> serde_json::Result<(Status, Value)>,
{
    match result {
        Ok(value) => {
            let (status, payload) = payload(value)?;
            Ok(Response { status, payload })
        }
        Err(e) => Ok(Response::status(e.status())),
    }
}

pub fn execute<P: Platform>(
    session: &Session<P>,
    request: &Request,
) -> serde_json::Result<Response> {
    debug!("{:?}", request);
    match request {
        Request::ReadMemory(InContext { context, request }) => respond(
            session.read_memory(*context, request),
            |outcome| Ok((Status::Success, serde_json::to_value(outcome)?)),
        ),
        Request::EditMemory(InContext { context, request }) => respond(
            session.edit_memory(*context, request),
            |written| Ok((Status::Success, json!({ "bytes_written": written }))),
        ),
        Request::SearchMemory(InContext { context, request }) => respond(
            session.search_memory(*context, request),
            |outcome| {
                let status = outcome.status();
                Ok((
                    status,
                    json!({ "matched": outcome.matched(), "results": outcome.results }),
                ))
            },
        ),
        Request::SearchMemoryInteractive(request) => {
            let mut reported = vec![];
            let result = session.search_memory_interactive(request, &mut |a| reported.push(a));
            respond(result, |outcome| {
                Ok((
                    outcome.status(),
                    json!({ "matched": outcome.matched, "reported": reported }),
                ))
            })
        }
        Request::Msr(request) => respond(session.read_or_write_msr(request), |outcome| {
            Ok((Status::Success, json!({ "values": outcome.values })))
        }),
        Request::Prealloc(request) => respond(session.reserve_preallocated_pools(request), |_| {
            Ok((Status::Success, Value::Null))
        }),
        Request::Preactivate(request) => respond(session.preactivate(request), |_| {
            Ok((Status::Success, Value::Null))
        }),
        Request::InstallShadow {
            address,
            previous_byte,
        } => Ok(match session.install_shadow(*address, *previous_byte) {
            Some(_) => Response::status(Status::Success),
            None => Response::status(Status::InvalidParameter),
        }),
        Request::RemoveShadow { address } => {
            let id = session.breakpoints().find(*address);
            Ok(match id.and_then(|id| session.remove_shadow(id)) {
                Some(_) => Response::status(Status::Success),
                None => Response::status(Status::InvalidParameter),
            })
        }
    }
}

pub fn replay<P: Platform>(
    session: &Session<P>,
    requests: &[Request],
) -> serde_json::Result<Vec<Response>> {
    requests.iter().map(|r| execute(session, r)).collect()
}
