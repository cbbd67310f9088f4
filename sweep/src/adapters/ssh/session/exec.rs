// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result, anyhow};
use russh::ChannelMsg;
use sweepcore::exec::ExecCapture;

use super::SessionManager;

fn handle_capture_message(msg: &ChannelMsg, capture: &mut ExecCapture) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            capture.stdout.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            capture.stderr.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            capture.exit_code = *exit_status as i32;
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

impl SessionManager {
    /// Runs `cmd` to completion, collecting stdout, stderr and the exit code.
    pub async fn exec_capture(&self, cmd: &str) -> Result<ExecCapture> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| anyhow!("SSH handle lost"))?;
        let mut chan = handle
            .channel_open_session()
            .await
            .context("open session")?;
        tracing::debug!("executing '{}'", cmd);
        chan.exec(true, cmd).await.context("exec request")?;

        let mut capture = ExecCapture::default();
        while let Some(msg) = chan.wait().await {
            if handle_capture_message(&msg, &mut capture) {
                break;
            }
        }

        let _ = chan.close().await;
        Ok(capture)
    }
}
