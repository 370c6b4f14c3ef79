//! Placeholder parsing and substitution for build steps.
//!
//! Step commands, env values and copy paths may reference values that are
//! only known once a session is running.
//!
//! # Placeholder Formats
//!
//! - `$${install_dir}` - the shared install root
//! - `$${project_dir}` - directory the project was loaded from
//! - `$${source_dir}` - root of the descriptor's fetched source
//! - `$${name}` - the descriptor's name
//! - `$${version}` - the descriptor's version
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$install_dir` work without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use kiln_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${install_dir}/embedded/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::InstallDir),
//!     Segment::Literal("/embedded/bin:$PATH".to_string()),
//! ]);
//! ```

use std::fmt;

use thiserror::Error;

/// A parsed placeholder reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
  InstallDir,
  ProjectDir,
  SourceDir,
  Name,
  Version,
}

impl Placeholder {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::InstallDir => "install_dir",
      Self::ProjectDir => "project_dir",
      Self::SourceDir => "source_dir",
      Self::Name => "name",
      Self::Version => "version",
    }
  }
}

impl fmt::Display for Placeholder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "$${{{}}}", self.as_str())
  }
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  /// Literal text (no placeholders)
  Literal(String),

  /// A placeholder to be resolved
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("placeholder {0} has no value in this context")]
  Unresolved(Placeholder),
}

/// Supplies values for placeholders during substitution.
pub trait Resolver {
  fn resolve(&self, placeholder: Placeholder) -> Result<&str, PlaceholderError>;
}

/// Values available to one descriptor's steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepVars {
  pub install_dir: String,
  pub project_dir: String,
  pub source_dir: String,
  pub name: String,
  pub version: String,
}

impl StepVars {
  /// Environment variables exported to step commands.
  pub fn env(&self) -> [(&'static str, &str); 3] {
    [
      ("install_dir", self.install_dir.as_str()),
      ("project_dir", self.project_dir.as_str()),
      ("source_dir", self.source_dir.as_str()),
    ]
  }
}

impl Resolver for StepVars {
  fn resolve(&self, placeholder: Placeholder) -> Result<&str, PlaceholderError> {
    let value = match placeholder {
      Placeholder::InstallDir => &self.install_dir,
      Placeholder::ProjectDir => &self.project_dir,
      Placeholder::SourceDir => &self.source_dir,
      Placeholder::Name => &self.name,
      Placeholder::Version => &self.version,
    };
    if value.is_empty() {
      return Err(PlaceholderError::Unresolved(placeholder));
    }
    Ok(value)
  }
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is unclosed or names an unknown value.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    if !matches!(chars.peek(), Some((_, '$'))) {
      // Lone `$`: shell variable, pass through.
      literal.push('$');
      continue;
    }
    chars.next();

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();
        if matches!(chars.peek(), Some((_, '{'))) {
          chars.next();
          literal.push_str("$${");
        } else {
          literal.push_str("$$$");
        }
      }
      Some((_, '{')) => {
        chars.next();
        if !literal.is_empty() {
          segments.push(Segment::Literal(std::mem::take(&mut literal)));
        }

        let mut content = String::new();
        let mut found_close = false;
        for (_, c) in chars.by_ref() {
          if c == '}' {
            found_close = true;
            break;
          }
          content.push(c);
        }
        if !found_close {
          return Err(PlaceholderError::Unclosed(pos));
        }

        segments.push(Segment::Placeholder(parse_placeholder_name(content.trim())?));
      }
      _ => literal.push_str("$$"),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

fn parse_placeholder_name(name: &str) -> Result<Placeholder, PlaceholderError> {
  match name {
    "install_dir" => Ok(Placeholder::InstallDir),
    "project_dir" => Ok(Placeholder::ProjectDir),
    "source_dir" => Ok(Placeholder::SourceDir),
    "name" => Ok(Placeholder::Name),
    "version" => Ok(Placeholder::Version),
    other => Err(PlaceholderError::Unknown(other.to_string())),
  }
}

/// Parse and substitute in one step.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let segments = parse(input)?;
  substitute_segments(&segments, resolver)
}

/// Substitute placeholders in pre-parsed segments.
pub fn substitute_segments(segments: &[Segment], resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::new();
  for segment in segments {
    match segment {
      Segment::Literal(s) => result.push_str(s),
      Segment::Placeholder(p) => result.push_str(resolver.resolve(*p)?),
    }
  }
  Ok(result)
}

/// Whether `input` references the install root, either as a placeholder or
/// through the exported `install_dir` variable.
pub fn mentions_install_dir(input: &str) -> bool {
  input.contains(Placeholder::InstallDir.as_str())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vars() -> StepVars {
    StepVars {
      install_dir: "/opt/datadog-agent".to_string(),
      project_dir: "/src/omnibus".to_string(),
      source_dir: "/var/cache/kiln/src/sds".to_string(),
      name: "sds".to_string(),
      version: "main".to_string(),
    }
  }

  #[test]
  fn copy_destination_into_install_tree() {
    let cmd = "cp target/release/libsds_go.so $${install_dir}/embedded/lib";
    assert_eq!(
      substitute(cmd, &vars()).unwrap(),
      "cp target/release/libsds_go.so /opt/datadog-agent/embedded/lib"
    );
  }

  #[test]
  fn multiple_placeholders_and_shell_variables() {
    let cmd = "cd $${source_dir} && tar czf $${project_dir}/$${name}-$${version}.tgz . && echo $HOME";
    assert_eq!(
      substitute(cmd, &vars()).unwrap(),
      "cd /var/cache/kiln/src/sds && tar czf /src/omnibus/sds-main.tgz . && echo $HOME"
    );
  }

  #[test]
  fn shell_style_dollar_sequences_pass_through() {
    assert_eq!(substitute("echo $$ ${HOME} $install_dir", &vars()).unwrap(), "echo $$ ${HOME} $install_dir");
    assert_eq!(substitute("a$", &vars()).unwrap(), "a$");
    assert_eq!(substitute("$$", &vars()).unwrap(), "$$");
  }

  #[test]
  fn escape_produces_literal_placeholder() {
    assert_eq!(substitute("echo $$${install_dir}", &vars()).unwrap(), "echo $${install_dir}");
    assert_eq!(substitute("$$$x", &vars()).unwrap(), "$$$x");
  }

  #[test]
  fn whitespace_inside_braces_is_ignored() {
    assert_eq!(substitute("$${ name }", &vars()).unwrap(), "sds");
  }

  #[test]
  fn unclosed_placeholder_reports_position() {
    assert_eq!(parse("abc $${install_dir"), Err(PlaceholderError::Unclosed(4)));
  }

  #[test]
  fn unknown_placeholder_is_rejected() {
    assert_eq!(
      parse("$${prefix}/bin"),
      Err(PlaceholderError::Unknown("prefix".to_string()))
    );
  }

  #[test]
  fn empty_value_is_unresolved() {
    let vars = StepVars {
      project_dir: String::new(),
      ..vars()
    };
    assert_eq!(
      substitute("$${project_dir}", &vars),
      Err(PlaceholderError::Unresolved(Placeholder::ProjectDir))
    );
  }

  #[test]
  fn display_round_trips_through_parse() {
    for p in [
      Placeholder::InstallDir,
      Placeholder::ProjectDir,
      Placeholder::SourceDir,
      Placeholder::Name,
      Placeholder::Version,
    ] {
      assert_eq!(parse(&p.to_string()).unwrap(), vec![Segment::Placeholder(p)]);
    }
  }

  #[test]
  fn detects_install_dir_mentions() {
    assert!(mentions_install_dir("cp x $${install_dir}/embedded/bin"));
    assert!(mentions_install_dir("cp x \"$install_dir/embedded/bin\""));
    assert!(!mentions_install_dir("cargo build --release"));
  }
}
