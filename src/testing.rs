/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{bail, Result};
use std::cell::RefCell;

use crate::exec::{Executor, Invocation};

/**
 * An Executor that runs nothing.  It records each invocation, returns canned
 * output for commands containing a given fragment, and fails commands
 * containing another.
 */
#[derive(Default)]
pub struct RecordingExecutor {
    calls: RefCell<Vec<Invocation>>,
    responses: RefCell<Vec<(String, String)>>,
    failures: RefCell<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new() -> RecordingExecutor {
        RecordingExecutor::default()
    }

    pub fn respond(&self, fragment: &str, output: &str) -> &Self {
        self.responses
            .borrow_mut()
            .push((fragment.to_string(), output.to_string()));
        self
    }

    pub fn fail_on(&self, fragment: &str) -> &Self {
        self.failures.borrow_mut().push(fragment.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.borrow().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|i| i.to_string()).collect()
    }

    pub fn clear(&self) {
        self.calls.borrow_mut().clear();
    }
}

impl Executor for RecordingExecutor {
    fn execute(&self, inv: &Invocation) -> Result<String> {
        self.calls.borrow_mut().push(inv.clone());
        let cmd = inv.to_string();

        if self.failures.borrow().iter().any(|f| cmd.contains(f.as_str())) {
            if inv.ignore_fail {
                return Ok(String::new());
            }
            bail!("exec {} failed: exit status: 1", cmd);
        }

        Ok(self
            .responses
            .borrow()
            .iter()
            .find(|(f, _)| cmd.contains(f.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}
