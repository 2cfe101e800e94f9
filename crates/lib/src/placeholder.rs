//! Placeholder parsing and substitution for recipe invocations.
//!
//! Build and smoke-test invocations reference values that are only known once a
//! work unit is scheduled: its output directory, option values, the compiler of
//! the active profile. This module parses those references and substitutes the
//! resolved values.
//!
//! # Placeholder Formats
//!
//! - `$${out}` - the unit's artifact directory
//! - `$${src}` - the recipe version folder
//! - `$${work}` - the unit's scratch working directory
//! - `$${opt:NAME}` - value of option axis NAME
//! - `$${env:KEY}` - environment axis (`compiler`, `linkage`, ...) or profile variable
//! - `$${recipe:name|version|revision|fingerprint}` - unit identity
//! - `$${test:bin|sources|dir}` - smoke-test binary path, source list, build directory
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use pkgcheck_lib::placeholder::{parse, Segment, Placeholder};
//!
//! let segments = parse("$${out}/lib:$HOME").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Out),
//!     Segment::Literal("/lib:$HOME".to_string()),
//! ]);
//! ```

use std::fmt;

use thiserror::Error;

/// Unit identity fields available as `$${recipe:FIELD}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeField {
  Name,
  Version,
  Revision,
  Fingerprint,
}

/// Smoke-test fields available as `$${test:FIELD}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestField {
  /// Path the compile step must produce.
  Bin,
  /// Space-separated source paths; spliced as separate arguments in argv form.
  Sources,
  /// Fresh directory the smoke test is compiled in.
  Dir,
}

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  Out,
  Src,
  Work,
  Option(String),
  Env(String),
  Recipe(RecipeField),
  Test(TestField),
}

impl fmt::Display for Placeholder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Placeholder::Out => write!(f, "$${{out}}"),
      Placeholder::Src => write!(f, "$${{src}}"),
      Placeholder::Work => write!(f, "$${{work}}"),
      Placeholder::Option(name) => write!(f, "$${{opt:{name}}}"),
      Placeholder::Env(key) => write!(f, "$${{env:{key}}}"),
      Placeholder::Recipe(field) => {
        let field = match field {
          RecipeField::Name => "name",
          RecipeField::Version => "version",
          RecipeField::Revision => "revision",
          RecipeField::Fingerprint => "fingerprint",
        };
        write!(f, "$${{recipe:{field}}}")
      }
      Placeholder::Test(field) => {
        let field = match field {
          TestField::Bin => "bin",
          TestField::Sources => "sources",
          TestField::Dir => "dir",
        };
        write!(f, "$${{test:{field}}}")
      }
    }
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

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved placeholder {0}")]
  Unresolved(String),
}

/// Supplies values for placeholders while an invocation is prepared.
pub trait Resolver {
  fn resolve_out(&self) -> Result<&str, PlaceholderError>;

  fn resolve_src(&self) -> Result<&str, PlaceholderError>;

  fn resolve_work(&self) -> Result<&str, PlaceholderError>;

  fn resolve_option(&self, name: &str) -> Result<&str, PlaceholderError>;

  fn resolve_env(&self, key: &str) -> Result<&str, PlaceholderError>;

  fn resolve_recipe(&self, field: RecipeField) -> Result<&str, PlaceholderError>;

  /// Test fields only resolve while a smoke test is being prepared.
  fn resolve_test(&self, field: TestField) -> Result<&str, PlaceholderError>;
}

/// Parse a string containing placeholders into segments.
///
/// # Errors
///
/// Returns an error if a placeholder is malformed (unclosed, unknown type, etc.)
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut chars = input.char_indices().peekable();

  while let Some((pos, ch)) = chars.next() {
    if ch != '$' {
      literal.push(ch);
      continue;
    }

    match chars.peek() {
      Some((_, '$')) => {
        chars.next();

        match chars.peek() {
          Some((_, '$')) => {
            chars.next();

            // $$${ is the escape for a literal $${
            match chars.peek() {
              Some((_, '{')) => {
                literal.push_str("$${");
                chars.next();
              }
              _ => literal.push_str("$$$"),
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

            segments.push(Segment::Placeholder(parse_placeholder_content(&content)?));
          }
          _ => literal.push_str("$$"),
        }
      }
      // Lone $: shell variables pass through
      _ => literal.push('$'),
    }
  }

  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }

  Ok(segments)
}

/// Parse the content inside a placeholder (everything between `$${` and `}`).
fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  match content {
    "out" => return Ok(Placeholder::Out),
    "src" => return Ok(Placeholder::Src),
    "work" => return Ok(Placeholder::Work),
    _ => {}
  }

  let (kind, rest) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{content}'")))?;

  if rest.is_empty() {
    return Err(PlaceholderError::Malformed(format!("empty key in '{content}'")));
  }

  match kind {
    "opt" => Ok(Placeholder::Option(rest.to_string())),
    "env" => Ok(Placeholder::Env(rest.to_string())),
    "recipe" => {
      let field = match rest {
        "name" => RecipeField::Name,
        "version" => RecipeField::Version,
        "revision" => RecipeField::Revision,
        "fingerprint" => RecipeField::Fingerprint,
        _ => return Err(PlaceholderError::Malformed(format!("unknown recipe field '{rest}'"))),
      };
      Ok(Placeholder::Recipe(field))
    }
    "test" => {
      let field = match rest {
        "bin" => TestField::Bin,
        "sources" => TestField::Sources,
        "dir" => TestField::Dir,
        _ => return Err(PlaceholderError::Malformed(format!("unknown test field '{rest}'"))),
      };
      Ok(Placeholder::Test(field))
    }
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
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
      Segment::Placeholder(p) => result.push_str(resolve(p, resolver)?),
    }
  }

  Ok(result)
}

fn resolve<'r>(placeholder: &Placeholder, resolver: &'r impl Resolver) -> Result<&'r str, PlaceholderError> {
  match placeholder {
    Placeholder::Out => resolver.resolve_out(),
    Placeholder::Src => resolver.resolve_src(),
    Placeholder::Work => resolver.resolve_work(),
    Placeholder::Option(name) => resolver.resolve_option(name),
    Placeholder::Env(key) => resolver.resolve_env(key),
    Placeholder::Recipe(field) => resolver.resolve_recipe(*field),
    Placeholder::Test(field) => resolver.resolve_test(*field),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[derive(Default)]
  struct TestResolver {
    out: Option<String>,
    options: HashMap<String, String>,
    env: HashMap<String, String>,
    test_bin: Option<String>,
  }

  impl TestResolver {
    fn with_out(mut self, out: &str) -> Self {
      self.out = Some(out.to_string());
      self
    }

    fn with_option(mut self, name: &str, value: &str) -> Self {
      self.options.insert(name.to_string(), value.to_string());
      self
    }

    fn with_env(mut self, key: &str, value: &str) -> Self {
      self.env.insert(key.to_string(), value.to_string());
      self
    }

    fn with_test_bin(mut self, bin: &str) -> Self {
      self.test_bin = Some(bin.to_string());
      self
    }
  }

  impl Resolver for TestResolver {
    fn resolve_out(&self) -> Result<&str, PlaceholderError> {
      self
        .out
        .as_deref()
        .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Out.to_string()))
    }

    fn resolve_src(&self) -> Result<&str, PlaceholderError> {
      Ok("/recipes/zlib/all")
    }

    fn resolve_work(&self) -> Result<&str, PlaceholderError> {
      Ok("/store/work/abc")
    }

    fn resolve_option(&self, name: &str) -> Result<&str, PlaceholderError> {
      self
        .options
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Option(name.to_string()).to_string()))
    }

    fn resolve_env(&self, key: &str) -> Result<&str, PlaceholderError> {
      self
        .env
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Env(key.to_string()).to_string()))
    }

    fn resolve_recipe(&self, field: RecipeField) -> Result<&str, PlaceholderError> {
      Ok(match field {
        RecipeField::Name => "zlib",
        RecipeField::Version => "1.2.11",
        RecipeField::Revision => "0123456789ab",
        RecipeField::Fingerprint => "aabbccddeeff00112233",
      })
    }

    fn resolve_test(&self, field: TestField) -> Result<&str, PlaceholderError> {
      match field {
        TestField::Bin => self
          .test_bin
          .as_deref()
          .ok_or_else(|| PlaceholderError::Unresolved(Placeholder::Test(field).to_string())),
        _ => Err(PlaceholderError::Unresolved(Placeholder::Test(field).to_string())),
      }
    }
  }

  #[test]
  fn cmake_build_line() {
    let resolver = TestResolver::default()
      .with_out("/store/build/aabb")
      .with_option("shared", "True")
      .with_env("build_type", "Release");

    let cmd = "cmake -S $${src} -B $${work} -DBUILD_SHARED_LIBS=$${opt:shared} \
               -DCMAKE_BUILD_TYPE=$${env:build_type} -DCMAKE_INSTALL_PREFIX=$${out}";
    let result = substitute(cmd, &resolver).unwrap();

    assert_eq!(
      result,
      "cmake -S /recipes/zlib/all -B /store/work/abc -DBUILD_SHARED_LIBS=True \
       -DCMAKE_BUILD_TYPE=Release -DCMAKE_INSTALL_PREFIX=/store/build/aabb"
    );
  }

  #[test]
  fn smoke_test_compile_line() {
    let resolver = TestResolver::default()
      .with_out("/store/build/aabb")
      .with_env("compiler", "gcc")
      .with_test_bin("/store/work/abc/verify-0/test_package");

    let cmd = "$${env:compiler} test.c -I$${out}/include -L$${out}/lib -lz -o $${test:bin}";
    let result = substitute(cmd, &resolver).unwrap();

    assert_eq!(
      result,
      "gcc test.c -I/store/build/aabb/include -L/store/build/aabb/lib -lz -o /store/work/abc/verify-0/test_package"
    );
  }

  #[test]
  fn shell_script_with_variables() {
    let resolver = TestResolver::default().with_out("/store/build/aabb");

    let script = r#"if [ -z "$CC" ]; then
  CC=cc
fi
$CC -o "$${out}/bin/tool" main.c
exit $?"#;

    let result = substitute(script, &resolver).unwrap();
    assert_eq!(
      result,
      r#"if [ -z "$CC" ]; then
  CC=cc
fi
$CC -o "/store/build/aabb/bin/tool" main.c
exit $?"#
    );
  }

  #[test]
  fn recipe_identity_fields() {
    let resolver = TestResolver::default();
    let result = substitute("$${recipe:name}-$${recipe:version}+$${recipe:revision}", &resolver).unwrap();
    assert_eq!(result, "zlib-1.2.11+0123456789ab");
    assert_eq!(
      substitute("$${recipe:fingerprint}", &resolver).unwrap(),
      "aabbccddeeff00112233"
    );
  }

  #[test]
  fn placeholder_display_round_trips_through_parse() {
    for p in [
      Placeholder::Out,
      Placeholder::Option("with_zlib".to_string()),
      Placeholder::Env("compiler".to_string()),
      Placeholder::Recipe(RecipeField::Revision),
      Placeholder::Test(TestField::Sources),
    ] {
      assert_eq!(parse(&p.to_string()).unwrap(), vec![Segment::Placeholder(p)]);
    }
  }

  #[test]
  fn error_unclosed_placeholder() {
    let result = parse("make PREFIX=$${out");
    assert!(matches!(result, Err(PlaceholderError::Unclosed(12))));
  }

  #[test]
  fn error_unknown_placeholder_type() {
    let result = parse("$${action:0}");
    assert!(matches!(result, Err(PlaceholderError::UnknownType(ref s)) if s == "action"));
  }

  #[test]
  fn error_malformed() {
    assert!(matches!(parse("$${opt}"), Err(PlaceholderError::Malformed(_))));
    assert!(matches!(parse("$${opt:}"), Err(PlaceholderError::Malformed(_))));
    assert!(matches!(parse("$${recipe:author}"), Err(PlaceholderError::Malformed(_))));
    assert!(matches!(parse("$${test:exe}"), Err(PlaceholderError::Malformed(_))));
  }

  #[test]
  fn error_unresolved_option() {
    let resolver = TestResolver::default();
    let result = substitute("-DFOO=$${opt:foo}", &resolver);
    assert!(matches!(result, Err(PlaceholderError::Unresolved(ref s)) if s == "$${opt:foo}"));
  }

  #[test]
  fn error_test_field_outside_smoke_test() {
    let resolver = TestResolver::default();
    assert!(matches!(
      substitute("$${test:bin}", &resolver),
      Err(PlaceholderError::Unresolved(_))
    ));
  }

  #[test]
  fn lone_dollar_preserved() {
    let resolver = TestResolver::default();
    let result = substitute("costs $5 or more$", &resolver).unwrap();
    assert_eq!(result, "costs $5 or more$");
  }

  #[test]
  fn double_dollar_without_brace_preserved() {
    let resolver = TestResolver::default();
    let result = substitute("echo $$variable", &resolver).unwrap();
    assert_eq!(result, "echo $$variable");
  }

  #[test]
  fn escape_placeholder_syntax() {
    let resolver = TestResolver::default();
    let result = substitute("echo $$${out}", &resolver).unwrap();
    assert_eq!(result, "echo $${out}");
  }

  #[test]
  fn empty_input() {
    assert!(parse("").unwrap().is_empty());
  }

  #[test]
  fn adjacent_placeholders_no_separator() {
    let resolver = TestResolver::default().with_option("a", "foo").with_option("b", "bar");
    let result = substitute("$${opt:a}$${opt:b}", &resolver).unwrap();
    assert_eq!(result, "foobar");
  }

  #[test]
  fn out_placeholder_in_path() {
    let segments = parse("$${out}/bin").unwrap();
    assert_eq!(
      segments,
      vec![
        Segment::Placeholder(Placeholder::Out),
        Segment::Literal("/bin".to_string()),
      ]
    );
  }
}
