//! Script rendering for PowerShell and POSIX shells
//!
//! Script bodies are static text. Values are never spliced into the body;
//! they are bound as variables in a generated prelude with proper quoting.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::CHANGED_MARKER;

/// Shell dialect of a host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shell {
    PowerShell,
    Posix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Value {
    Str(String),
    Int(i64),
    Bool(bool),
    List(Vec<String>),
}

/// A script body plus the variables it expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    shell: Shell,
    vars: Vec<(String, Value)>,
    body: String,
}

impl Script {
    pub fn powershell(body: &str) -> Self {
        Self::new(Shell::PowerShell, body)
    }

    pub fn posix(body: &str) -> Self {
        Self::new(Shell::Posix, body)
    }

    pub fn new(shell: Shell, body: &str) -> Self {
        Self {
            shell,
            vars: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn shell(&self) -> Shell {
        self.shell
    }

    /// Bind a string variable
    pub fn var(mut self, name: &str, value: impl Into<String>) -> Self {
        self.vars.push((name.to_string(), Value::Str(value.into())));
        self
    }

    /// Bind an integer variable
    pub fn int(mut self, name: &str, value: i64) -> Self {
        self.vars.push((name.to_string(), Value::Int(value)));
        self
    }

    /// Bind a boolean variable (`$true`/`$false`, or `1`/`0` for POSIX)
    pub fn flag(mut self, name: &str, value: bool) -> Self {
        self.vars.push((name.to_string(), Value::Bool(value)));
        self
    }

    /// Bind a list variable (an array, or a space separated string for POSIX)
    pub fn list<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values = values.into_iter().map(Into::into).collect();
        self.vars.push((name.to_string(), Value::List(values)));
        self
    }

    /// Full script text including the prelude
    pub fn render(&self) -> String {
        match self.shell {
            Shell::PowerShell => self.render_powershell(),
            Shell::Posix => self.render_posix(),
        }
    }

    fn render_powershell(&self) -> String {
        let mut out = String::new();
        out.push_str("$ErrorActionPreference = 'Stop'\n");
        out.push_str("$ProgressPreference = 'SilentlyContinue'\n");
        out.push_str(&format!(
            "function Write-Changed {{ [Console]::Out.WriteLine('{}') }}\n",
            CHANGED_MARKER
        ));

        for (name, value) in &self.vars {
            let rendered = match value {
                Value::Str(s) => ps_quote(s),
                Value::Int(i) => i.to_string(),
                Value::Bool(true) => "$true".to_string(),
                Value::Bool(false) => "$false".to_string(),
                Value::List(items) => format!(
                    "@({})",
                    items.iter().map(|i| ps_quote(i)).collect::<Vec<_>>().join(", ")
                ),
            };
            out.push_str(&format!("${} = {}\n", name, rendered));
        }

        out.push_str("try {\n");
        out.push_str(&self.body);
        if !self.body.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("} catch {\n");
        out.push_str("    [Console]::Error.WriteLine(($_ | Out-String))\n");
        out.push_str("    exit 1\n");
        out.push_str("}\n");
        out.push_str("exit 0\n");
        out
    }

    fn render_posix(&self) -> String {
        let mut out = String::new();
        out.push_str("set -eu\n");
        out.push_str(&format!("changed() {{ echo '{}'; }}\n", CHANGED_MARKER));

        for (name, value) in &self.vars {
            let rendered = match value {
                Value::Str(s) => sh_quote(s),
                Value::Int(i) => i.to_string(),
                Value::Bool(b) => (if *b { "1" } else { "0" }).to_string(),
                Value::List(items) => sh_quote(&items.join(" ")),
            };
            out.push_str(&format!("{}={}\n", name, rendered));
        }

        out.push_str(&self.body);
        if !self.body.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

/// Characters PowerShell accepts as a single quote
const PS_SINGLE_QUOTES: [char; 5] = ['\'', '\u{2018}', '\u{2019}', '\u{201A}', '\u{201B}'];

/// Quote a PowerShell string literal
pub fn ps_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for c in value.chars() {
        if PS_SINGLE_QUOTES.contains(&c) {
            quoted.push(c);
        }
        quoted.push(c);
    }
    quoted.push('\'');
    quoted
}

/// Quote a POSIX shell word
pub fn sh_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Encode a script for `powershell.exe -EncodedCommand` (UTF-16LE, base64)
pub fn encode_powershell(script: &str) -> String {
    let bytes: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    STANDARD.encode(bytes)
}
