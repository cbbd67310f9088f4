// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout split into lines, trailing whitespace removed and empty lines dropped.
    pub fn stdout_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.stdout)
            .lines()
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.is_empty())
            .collect()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_lines_drops_blank_lines() {
        let capture = ExecCapture {
            stdout: b"first\r\n\n  second  \n".to_vec(),
            stderr: b"  oops \n".to_vec(),
            exit_code: 2,
        };
        assert_eq!(capture.stdout_lines(), vec!["first", "  second"]);
        assert_eq!(capture.stderr_text(), "oops");
        assert!(!capture.success());
    }
}
