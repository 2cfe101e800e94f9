use std::collections::BTreeMap;

use anyhow::Result;
use owo_colors::{OwoColorize, Stream};
use serde::Serialize;

use pkgcheck_lib::config::Environment;
use pkgcheck_lib::matrix::WorkUnit;
use pkgcheck_lib::recipe::RecipeId;
use pkgcheck_lib::util::hash::Fingerprint;

use super::{MatrixArgs, plan};
use crate::output::{OutputFormat, print_info, print_json, symbols};

#[derive(Serialize)]
struct ListedUnit<'a> {
  index: usize,
  fingerprint: &'a Fingerprint,
  recipe: &'a RecipeId,
  profile: &'a str,
  options: BTreeMap<String, String>,
  environment: &'a Environment,
  #[serde(skip_serializing_if = "Option::is_none")]
  skip: Option<&'a str>,
}

impl<'a> From<&'a WorkUnit> for ListedUnit<'a> {
  fn from(unit: &'a WorkUnit) -> Self {
    Self {
      index: unit.index,
      fingerprint: &unit.fingerprint,
      recipe: &unit.recipe.id,
      profile: &unit.profile,
      options: unit.configuration.options_map(),
      environment: &unit.configuration.environment,
      skip: unit.skip.as_deref(),
    }
  }
}

pub fn cmd_list(args: &MatrixArgs, output: OutputFormat) -> Result<()> {
  let plan = plan(args)?;

  if output.is_json() {
    let units: Vec<ListedUnit> = plan.units.iter().map(ListedUnit::from).collect();
    print_json(&units)?;
    return Ok(());
  }

  for unit in &plan.units {
    let fingerprint = unit.fingerprint.as_str();
    match &unit.skip {
      Some(reason) => println!(
        "{} {} {} {}",
        symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        fingerprint.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        unit,
        format!("(skip: {reason})").if_supports_color(Stream::Stdout, |s| s.dimmed())
      ),
      None => println!(
        "{} {} {}",
        symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
        fingerprint.if_supports_color(Stream::Stdout, |s| s.dimmed()),
        unit
      ),
    }
  }
  println!();
  print_info(&format!("{} units from {} recipes", plan.units.len(), plan.recipes));

  Ok(())
}
