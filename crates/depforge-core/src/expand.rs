//! `{placeholder}` expansion for target templates.
//!
//! Recognised variables:
//!
//! | Variable | Value |
//! |---|---|
//! | `{bucket}` | [`Settings::bucket`] (error when unset) |
//! | `{filename}` | the target's filename template |
//! | `{name}` | target name |
//! | `{version}` | target version |
//!
//! `{filename}` substitutes the raw template, which may itself contain
//! placeholders, so expansion repeats until the string is free of `{`.
//! Each pass is one level of nesting; [`MAX_EXPANSION_DEPTH`] passes are
//! allowed before the template is declared self-referential.

use thiserror::Error;

use crate::config::Settings;
use crate::target::Target;

/// Maximum number of substitution passes before giving up.
pub const MAX_EXPANSION_DEPTH: usize = 10;

/// Errors raised while expanding a template.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpandError {
    #[error("Possible infinite recursion expanding '{template}' ({depth} passes)")]
    RecursionLimit { template: String, depth: usize },

    #[error("Unknown variable '{name}' in '{template}'")]
    UnknownVariable { name: String, template: String },

    #[error("Variable '{name}' is not set (needed by '{template}')")]
    UndefinedVariable { name: String, template: String },

    #[error("Unclosed placeholder at position {position} in '{template}'")]
    Unclosed { position: usize, template: String },
}

/// Expands templates against one target and the run's settings.
#[derive(Debug, Clone, Copy)]
pub struct Expander<'a> {
    target: &'a Target,
    settings: &'a Settings,
}

impl<'a> Expander<'a> {
    pub fn new(target: &'a Target, settings: &'a Settings) -> Self {
        Self { target, settings }
    }

    /// Expand `template` until no placeholder remains.
    ///
    /// # Errors
    ///
    /// [`ExpandError::RecursionLimit`] when placeholders are still present after
    /// [`MAX_EXPANSION_DEPTH`] passes, or the first substitution error.
    pub fn expand(&self, template: &str) -> Result<String, ExpandError> {
        let mut current = template.to_string();
        for _ in 0..MAX_EXPANSION_DEPTH {
            current = self.substitute(&current)?;
            if !current.contains('{') {
                return Ok(current);
            }
        }
        Err(ExpandError::RecursionLimit {
            template: template.to_string(),
            depth: MAX_EXPANSION_DEPTH,
        })
    }

    pub fn filename(&self) -> Result<String, ExpandError> {
        self.expand(self.target.filename_template())
    }

    pub fn url(&self) -> Result<String, ExpandError> {
        self.expand(self.target.url_template())
    }

    pub fn source_subdir(&self) -> Result<String, ExpandError> {
        self.expand(self.target.source_subdir_template())
    }

    pub fn configure_subdir(&self) -> Result<String, ExpandError> {
        self.expand(self.target.configure_subdir_template())
    }

    fn lookup(&self, name: &str, template: &str) -> Result<&'a str, ExpandError> {
        match name {
            "bucket" => {
                self.settings
                    .bucket
                    .as_deref()
                    .ok_or_else(|| ExpandError::UndefinedVariable {
                        name: name.to_string(),
                        template: template.to_string(),
                    })
            }
            "filename" => Ok(self.target.filename_template()),
            "name" => Ok(self.target.name()),
            "version" => Ok(self.target.version()),
            _ => Err(ExpandError::UnknownVariable {
                name: name.to_string(),
                template: template.to_string(),
            }),
        }
    }

    /// One substitution pass over `input`.
    fn substitute(&self, input: &str) -> Result<String, ExpandError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        let mut offset = 0;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| ExpandError::Unclosed {
                position: offset + open,
                template: input.to_string(),
            })?;
            out.push_str(self.lookup(&after[..close], input)?);

            let consumed = open + close + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        Ok(out)
    }
}
