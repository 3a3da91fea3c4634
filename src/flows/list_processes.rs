//! Process listing. Processes are streamed to a callback state as the
//! agent produces them, so large listings yield results before the
//! request completes.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{FlowContext, FlowDefinition, FlowError, FlowState, HandlerResult};
use crate::models::Payload;
use crate::orchestration::correlator::Responses;

pub const LIST_PROCESSES: &str = "ListProcesses";
pub const PROCESS_TYPE: &str = "Process";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListProcessesArgs {
    /// Only processes whose executable path matches are reported
    #[serde(default)]
    pub filename_regex: Option<String>,
}

impl ListProcessesArgs {
    fn filter(&self) -> std::result::Result<Option<Regex>, FlowError> {
        self.filename_regex
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| FlowError::failed(format!("invalid filename_regex: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub pid: u32,
    #[serde(default)]
    pub ppid: Option<u32>,
    pub name: String,
    #[serde(default)]
    pub exe: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListProcessesState {
    ReceiveProcesses,
    Done,
}

impl FlowState for ListProcessesState {
    const ALL: &'static [Self] = &[Self::ReceiveProcesses, Self::Done];

    fn name(&self) -> &'static str {
        match self {
            Self::ReceiveProcesses => "ReceiveProcesses",
            Self::Done => "Done",
        }
    }
}

pub struct ListProcesses;

impl ListProcesses {
    fn args(ctx: &FlowContext) -> std::result::Result<ListProcessesArgs, FlowError> {
        Ok(ctx.args_as::<Option<ListProcessesArgs>>()?.unwrap_or_default())
    }

    fn receive(&self, ctx: &mut FlowContext, responses: Responses) -> HandlerResult {
        let filter = Self::args(ctx)?.filter()?;
        let mut seen: u64 = ctx.get("processes_seen")?.unwrap_or(0);
        let mut matched: u64 = ctx.get("processes_matched")?.unwrap_or(0);
        for payload in responses {
            let process: Process = payload.decode_json()?;
            seen += 1;
            let path = process.exe.as_deref().unwrap_or(&process.name);
            if filter.as_ref().map_or(true, |re| re.is_match(path)) {
                ctx.send_reply(payload);
                matched += 1;
            }
        }
        ctx.set("processes_seen", seen)?;
        ctx.set("processes_matched", matched)
    }
}

impl FlowDefinition for ListProcesses {
    type State = ListProcessesState;
    const FLOW_TYPE: &'static str = "ListProcesses";

    fn validate_args(&self, args: &Value) -> HandlerResult {
        serde_json::from_value::<Option<ListProcessesArgs>>(args.clone())
            .map_err(|e| FlowError::failed(format!("invalid ListProcesses arguments: {e}")))?
            .unwrap_or_default()
            .filter()
            .map(|_| ())
    }

    fn start(&self, ctx: &mut FlowContext) -> HandlerResult {
        ctx.call_client_with_callback(
            LIST_PROCESSES,
            Payload::empty("ListProcessesRequest"),
            ListProcessesState::Done,
            ListProcessesState::ReceiveProcesses,
        )?;
        Ok(())
    }

    fn handle(
        &self,
        state: ListProcessesState,
        ctx: &mut FlowContext,
        responses: Responses,
    ) -> HandlerResult {
        match state {
            ListProcessesState::ReceiveProcesses => self.receive(ctx, responses),
            // payloads were already delivered to the callback state
            ListProcessesState::Done if responses.success() => Ok(()),
            ListProcessesState::Done => Err(FlowError::failed(format!(
                "Failed to list processes: {}",
                responses
                    .status()
                    .and_then(|status| status.error_message.as_deref())
                    .unwrap_or("unknown error")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ClientId, Flow, FlowId};
    use chrono::Utc;
    use serde_json::json;

    fn process(pid: u32, exe: &str) -> Payload {
        Payload::json(
            PROCESS_TYPE,
            &Process {
                pid,
                ppid: Some(1),
                name: exe.rsplit('/').next().unwrap_or(exe).to_string(),
                exe: Some(exe.to_string()),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_callback_filters_and_accumulates() {
        let flow = Flow::new(
            ClientId::new("C.1"),
            FlowId::new("F1"),
            "ListProcesses",
            json!({"filename_regex": "^/usr/sbin/"}),
            "test",
            Utc::now(),
        );
        let mut ctx = FlowContext::new(flow, Utc::now());
        let first = Responses::partial(1, vec![process(10, "/usr/sbin/sshd"), process(11, "/bin/bash")]);
        let second = Responses::partial(1, vec![process(12, "/usr/sbin/cron")]);
        ListProcesses
            .handle(ListProcessesState::ReceiveProcesses, &mut ctx, first)
            .unwrap();
        ListProcesses
            .handle(ListProcessesState::ReceiveProcesses, &mut ctx, second)
            .unwrap();

        assert_eq!(ctx.get::<u64>("processes_seen").unwrap(), Some(3));
        assert_eq!(ctx.get::<u64>("processes_matched").unwrap(), Some(2));
    }

    #[test]
    fn test_invalid_regex_rejected_up_front() {
        assert!(FlowDefinition::validate_args(&ListProcesses, &json!({"filename_regex": "("})).is_err());
        assert!(FlowDefinition::validate_args(&ListProcesses, &json!({})).is_ok());
        assert!(FlowDefinition::validate_args(&ListProcesses, &Value::Null).is_ok());
    }
}
