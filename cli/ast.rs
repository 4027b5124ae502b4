// Copyright 2025 the modcdn authors. MIT license.

use deno_ast::swc::ast::Callee;
use deno_ast::swc::ast::CallExpr;
use deno_ast::swc::ast::ExportAll;
use deno_ast::swc::ast::Expr;
use deno_ast::swc::ast::ImportDecl;
use deno_ast::swc::ast::Lit;
use deno_ast::swc::ast::NamedExport;
use deno_ast::swc::ast::Str;
use deno_ast::swc::visit::Visit;
use deno_ast::swc::visit::VisitWith;
use deno_ast::MediaType;
use deno_ast::ModuleSpecifier;
use deno_ast::ParseParams;
use deno_ast::SourcePos;
use deno_ast::SourceRangedForSpanned;
use indexmap::IndexMap;

use crate::errors::AnyError;

/// Every module specifier in a parsed source, keyed by specifier text.
/// A specifier imported in several places carries all of its ranges so
/// one resolution patches every occurrence.
pub type CollectedSpecifiers = IndexMap<String, Vec<std::ops::Range<usize>>>;

/// A single replacement against byte offsets of the original text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
  pub range: std::ops::Range<usize>,
  pub new_text: String,
}

/// Parses `source` as an ES module and collects the specifier string of
/// every static import, string-literal dynamic import, re-export and
/// export-all, together with the byte range of the string literal
/// (quotes included).
pub fn collect_specifiers(
  specifier: &ModuleSpecifier,
  source: &str,
  media_type: MediaType,
) -> Result<CollectedSpecifiers, AnyError> {
  let parsed = deno_ast::parse_module(ParseParams {
    specifier: specifier.clone(),
    text: source.into(),
    media_type,
    capture_tokens: false,
    scope_analysis: false,
    maybe_syntax: None,
  })?;
  let mut collector = SpecifierCollector {
    source_start: parsed.text_info_lazy().range().start,
    specifiers: IndexMap::new(),
  };
  // parse_module always yields a module program
  parsed.module().visit_with(&mut collector);
  Ok(collector.specifiers)
}

struct SpecifierCollector {
  source_start: SourcePos,
  specifiers: CollectedSpecifiers,
}

impl SpecifierCollector {
  fn add(&mut self, node: &Str) {
    let range = node.range().as_byte_range(self.source_start);
    self
      .specifiers
      .entry(node.value.to_string())
      .or_default()
      .push(range);
  }
}

impl Visit for SpecifierCollector {
  fn visit_import_decl(&mut self, node: &ImportDecl) {
    if !node.type_only {
      self.add(&node.src);
    }
  }

  fn visit_named_export(&mut self, node: &NamedExport) {
    if let Some(src) = &node.src {
      self.add(src);
    }
  }

  fn visit_export_all(&mut self, node: &ExportAll) {
    self.add(&node.src);
  }

  fn visit_call_expr(&mut self, node: &CallExpr) {
    node.visit_children_with(self);
    if !matches!(node.callee, Callee::Import(_)) {
      return;
    }
    // only string-literal dynamic imports are resolvable
    if let Some(arg) = node.args.first() {
      if arg.spread.is_none() {
        if let Expr::Lit(Lit::Str(src)) = &*arg.expr {
          self.add(src);
        }
      }
    }
  }
}

/// Applies accumulated replacements in one pass. Changes must not
/// overlap; they may be given in any order.
pub fn apply_text_changes(
  source: &str,
  mut changes: Vec<TextChange>,
) -> String {
  changes.sort_by_key(|change| (change.range.start, change.range.end));
  let mut output =
    String::with_capacity(source.len() + changes.len() * 16);
  let mut last_index = 0;
  for change in changes {
    debug_assert!(
      change.range.start >= last_index,
      "overlapping text changes"
    );
    output.push_str(&source[last_index..change.range.start]);
    output.push_str(&change.new_text);
    last_index = change.range.end;
  }
  output.push_str(&source[last_index..]);
  output
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  fn collect(source: &str) -> CollectedSpecifiers {
    let specifier = ModuleSpecifier::parse("cdn:/npm/x@1.0.0/index.js").unwrap();
    collect_specifiers(&specifier, source, MediaType::JavaScript).unwrap()
  }

  #[test]
  fn collects_every_specifier_kind() {
    let source = r#"import a from "./a.js";
import { b } from 'bare-pkg';
export { c } from "./c.js";
export * from "./d.js";
const lazy = await import("./e.js");
const dynamic = await import(someVariable);
"#;
    let collected = collect(source);
    let keys: Vec<_> = collected.keys().map(|s| s.as_str()).collect();
    assert_eq!(keys, vec!["./a.js", "bare-pkg", "./c.js", "./d.js", "./e.js"]);
  }

  #[test]
  fn repeated_specifiers_share_one_entry_with_all_ranges() {
    let source = r#"import a from "./a.js";
export { b } from "./a.js";
"#;
    let collected = collect(source);
    assert_eq!(collected.len(), 1);
    assert_eq!(collected["./a.js"].len(), 2);
  }

  #[test]
  fn ranges_cover_the_quoted_literal() {
    let source = r#"import a from "./a.js";"#;
    let collected = collect(source);
    let range = collected["./a.js"][0].clone();
    assert_eq!(&source[range], "\"./a.js\"");
  }

  #[test]
  fn parse_failure_is_an_error_for_the_caller_to_degrade() {
    let specifier = ModuleSpecifier::parse("cdn:/npm/x@1.0.0/index.js").unwrap();
    assert!(collect_specifiers(
      &specifier,
      "import from from from;",
      MediaType::JavaScript
    )
    .is_err());
  }

  #[test]
  fn applies_changes_range_accurately_in_any_order() {
    let source = r#"import a from "./a.js";
import b from "./b.js";
"#;
    let collected = collect(source);
    let mut changes = Vec::new();
    for (specifier, ranges) in collected.iter().rev() {
      let replacement = format!("\"/npm/x@1.0.0/{}!!cdnv:pre.1\"",
        specifier.trim_start_matches("./"));
      for range in ranges {
        changes.push(TextChange {
          range: range.clone(),
          new_text: replacement.clone(),
        });
      }
    }
    let rewritten = apply_text_changes(source, changes);
    assert_eq!(
      rewritten,
      "import a from \"/npm/x@1.0.0/a.js!!cdnv:pre.1\";\nimport b from \"/npm/x@1.0.0/b.js!!cdnv:pre.1\";\n"
    );
  }

  #[test]
  fn unchanged_when_no_changes() {
    assert_eq!(apply_text_changes("const x = 1;", Vec::new()), "const x = 1;");
  }
}
