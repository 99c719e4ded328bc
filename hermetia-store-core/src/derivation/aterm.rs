// SPDX-FileCopyrightText: 2026 Jörg Thalheim
// SPDX-License-Identifier: MIT

//! ATerm serialisation and deserialisation for derivation (`.drv`) files.
//!
//! The ATerm format is the canonical on-disk representation of derivations:
//!
//! ```text
//! Derive([(outputs)],[(input_drvs)],[(input_srcs)],"platform","builder",[(args)],[(env)])
//! ```
//!
//! The SHA-256 of this text is the derivation's identity, so serialisation
//! must be byte-stable: maps are emitted in sorted order and strings are
//! escaped exactly one way.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use crate::content_address::{ContentAddress, ContentAddressMethodAlgorithm};
use crate::hash::Hash;
use crate::store_path::{StoreDir, StorePath, StorePathError};

use super::output::output_path_name;
use super::{Derivation, DerivationOutput, DerivationOutputs, OutputName, StructuredAttrs};

use super::DerivationOptions;

/// Env key that carries structured attributes as JSON.
const STRUCTURED_ATTRS_KEY: &str = "__json";

#[derive(Debug, Error)]
pub enum ATermError {
    #[error("unexpected end of input at position {0}")]
    UnexpectedEof(usize),

    #[error("at position {pos}: expected {expected}, got {got:?}")]
    Expected {
        pos: usize,
        expected: String,
        got: String,
    },

    #[error("invalid store path: {0}")]
    InvalidStorePath(#[from] StorePathError),

    #[error("invalid derivation output: {0}")]
    InvalidOutput(String),

    #[error("invalid structured attrs JSON: {0}")]
    InvalidStructuredAttrs(String),
}

/// Serialise a derivation to its canonical ATerm text.
pub fn unparse(store_dir: &StoreDir, drv: &Derivation) -> Result<String, StorePathError> {
    let mut s = String::with_capacity(4096);
    s.push_str("Derive(");

    write_list(&mut s, drv.outputs.iter(), |s, (output_name, output)| {
        let (path_str, method_str, hash_str) =
            encode_output_fields(store_dir, &drv.name, output_name, output)?;
        s.push('(');
        write_string(s, output_name.as_str());
        s.push(',');
        write_string(s, &path_str);
        s.push(',');
        write_string(s, &method_str);
        s.push(',');
        write_string(s, &hash_str);
        s.push(')');
        Ok(())
    })?;
    s.push(',');

    write_list(&mut s, drv.input_drvs.iter(), |s, (drv_path, outputs)| {
        s.push('(');
        write_string(s, &store_dir.display_path(drv_path));
        s.push(',');
        write_list(s, outputs.iter(), |s, name| {
            write_string(s, name.as_str());
            Ok(())
        })?;
        s.push(')');
        Ok(())
    })?;
    s.push(',');

    write_list(&mut s, drv.input_srcs.iter(), |s, path| {
        write_string(s, &store_dir.display_path(path));
        Ok(())
    })?;
    s.push(',');

    write_string(&mut s, &drv.platform);
    s.push(',');
    write_string(&mut s, &drv.builder);
    s.push(',');

    write_list(&mut s, drv.args.iter(), |s, arg| {
        write_string(s, arg);
        Ok(())
    })?;
    s.push(',');

    // Env entries, with structured attrs re-inserted under their key so the
    // identity covers them.
    let mut env: BTreeMap<&str, String> = drv
        .env
        .iter()
        .map(|(k, v)| (k.as_str(), v.clone()))
        .collect();
    if let Some(sa) = &drv.structured_attrs {
        let json_text = serde_json::Value::Object(sa.attrs.clone()).to_string();
        env.insert(STRUCTURED_ATTRS_KEY, json_text);
    }
    write_list(&mut s, env.iter(), |s, (key, value)| {
        s.push('(');
        write_string(s, key);
        s.push(',');
        write_string(s, value);
        s.push(')');
        Ok(())
    })?;

    s.push(')');
    Ok(s)
}

/// Parse a `.drv` file in ATerm format. `name` is the derivation name,
/// taken from the `.drv` file name without the suffix.
pub fn parse(store_dir: &StoreDir, input: &str, name: &str) -> Result<Derivation, ATermError> {
    let mut p = Parser::new(input);

    p.expect_str("Derive(")?;
    let outputs = p.parse_outputs(store_dir)?;
    p.expect_char(',')?;
    let input_drvs = p.parse_input_drvs(store_dir)?;
    p.expect_char(',')?;
    let input_srcs = p.parse_input_srcs(store_dir)?;
    p.expect_char(',')?;
    let platform = p.parse_string()?;
    p.expect_char(',')?;
    let builder = p.parse_string()?;
    p.expect_char(',')?;
    let args = p.parse_string_list()?;
    p.expect_char(',')?;
    let mut env = p.parse_env()?;
    p.expect_char(')')?;

    let structured_attrs = match env.remove(STRUCTURED_ATTRS_KEY) {
        Some(json) => match serde_json::from_str(&json) {
            Ok(serde_json::Value::Object(attrs)) => Some(StructuredAttrs { attrs }),
            Ok(_) => {
                return Err(ATermError::InvalidStructuredAttrs(
                    "not a JSON object".into(),
                ));
            }
            Err(e) => return Err(ATermError::InvalidStructuredAttrs(e.to_string())),
        },
        None => None,
    };

    let options = DerivationOptions::from_env(&env);

    Ok(Derivation {
        name: name.parse()?,
        outputs,
        input_srcs,
        input_drvs,
        platform,
        builder,
        args,
        env,
        options,
        structured_attrs,
    })
}

fn encode_output_fields(
    store_dir: &StoreDir,
    drv_name: &crate::store_path::StorePathName,
    output_name: &OutputName,
    output: &DerivationOutput,
) -> Result<(String, String, String), StorePathError> {
    Ok(match output {
        DerivationOutput::InputAddressed(path) => {
            (store_dir.display_path(path), String::new(), String::new())
        }
        DerivationOutput::CaFixed(ca) => {
            let name = output_path_name(drv_name, output_name)?;
            let path = store_dir.make_path_from_ca(&name, ca, &Default::default())?;
            (
                store_dir.display_path(&path),
                ca.method().to_string(),
                ca.hash().to_base16(),
            )
        }
        DerivationOutput::CaFloating(method) => {
            (String::new(), method.to_string(), String::new())
        }
        DerivationOutput::Deferred => (String::new(), String::new(), String::new()),
        DerivationOutput::Impure(method) => {
            (String::new(), method.to_string(), "impure".to_string())
        }
    })
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

fn write_list<I, F>(out: &mut String, items: I, mut f: F) -> Result<(), StorePathError>
where
    I: Iterator,
    F: FnMut(&mut String, I::Item) -> Result<(), StorePathError>,
{
    out.push('[');
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(',');
        }
        f(out, item)?;
    }
    out.push(']');
    Ok(())
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Parser {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Result<u8, ATermError> {
        self.input
            .get(self.pos)
            .copied()
            .ok_or(ATermError::UnexpectedEof(self.pos))
    }

    fn expect_char(&mut self, c: char) -> Result<(), ATermError> {
        let got = self.peek()?;
        if got != c as u8 {
            return Err(ATermError::Expected {
                pos: self.pos,
                expected: c.to_string(),
                got: (got as char).to_string(),
            });
        }
        self.pos += 1;
        Ok(())
    }

    fn expect_str(&mut self, s: &str) -> Result<(), ATermError> {
        for c in s.chars() {
            self.expect_char(c)?;
        }
        Ok(())
    }

    fn parse_string(&mut self) -> Result<String, ATermError> {
        self.expect_char('"')?;
        let mut out = String::new();
        loop {
            match self.peek()? {
                b'"' => {
                    self.pos += 1;
                    return Ok(out);
                }
                b'\\' => {
                    self.pos += 1;
                    let escaped = self.peek()?;
                    out.push(match escaped {
                        b'n' => '\n',
                        b'r' => '\r',
                        b't' => '\t',
                        other => other as char,
                    });
                    self.pos += 1;
                }
                _ => {
                    // Consume one UTF-8 code point.
                    let rest = &self.input[self.pos..];
                    let s = std::str::from_utf8(rest).map_err(|_| ATermError::Expected {
                        pos: self.pos,
                        expected: "UTF-8 text".into(),
                        got: "invalid bytes".into(),
                    })?;
                    let c = s.chars().next().ok_or(ATermError::UnexpectedEof(self.pos))?;
                    out.push(c);
                    self.pos += c.len_utf8();
                }
            }
        }
    }

    fn parse_list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ATermError>,
    ) -> Result<Vec<T>, ATermError> {
        self.expect_char('[')?;
        let mut out = Vec::new();
        if self.peek()? == b']' {
            self.pos += 1;
            return Ok(out);
        }
        loop {
            out.push(item(self)?);
            match self.peek()? {
                b',' => self.pos += 1,
                b']' => {
                    self.pos += 1;
                    return Ok(out);
                }
                other => {
                    return Err(ATermError::Expected {
                        pos: self.pos,
                        expected: "',' or ']'".into(),
                        got: (other as char).to_string(),
                    });
                }
            }
        }
    }

    fn parse_string_list(&mut self) -> Result<Vec<String>, ATermError> {
        self.parse_list(|p| p.parse_string())
    }

    fn parse_store_path(&mut self, store_dir: &StoreDir) -> Result<StorePath, ATermError> {
        let s = self.parse_string()?;
        Ok(store_dir.parse_path(&s)?)
    }

    fn parse_outputs(&mut self, store_dir: &StoreDir) -> Result<DerivationOutputs, ATermError> {
        let entries = self.parse_list(|p| {
            p.expect_char('(')?;
            let name = p.parse_string()?;
            p.expect_char(',')?;
            let path = p.parse_string()?;
            p.expect_char(',')?;
            let method = p.parse_string()?;
            p.expect_char(',')?;
            let hash = p.parse_string()?;
            p.expect_char(')')?;
            Ok((name, path, method, hash))
        })?;

        let mut outputs = DerivationOutputs::new();
        for (name, path, method, hash) in entries {
            let output_name: OutputName = name.parse()?;
            let output = decode_output_fields(store_dir, &path, &method, &hash)?;
            outputs.insert(output_name, output);
        }
        Ok(outputs)
    }

    fn parse_input_drvs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeMap<StorePath, BTreeSet<OutputName>>, ATermError> {
        let entries = self.parse_list(|p| {
            p.expect_char('(')?;
            let path = p.parse_store_path(store_dir)?;
            p.expect_char(',')?;
            let outputs = p.parse_string_list()?;
            p.expect_char(')')?;
            Ok((path, outputs))
        })?;

        let mut map = BTreeMap::new();
        for (path, outputs) in entries {
            let names = outputs
                .into_iter()
                .map(|o| o.parse())
                .collect::<Result<BTreeSet<OutputName>, _>>()?;
            map.insert(path, names);
        }
        Ok(map)
    }

    fn parse_input_srcs(
        &mut self,
        store_dir: &StoreDir,
    ) -> Result<BTreeSet<StorePath>, ATermError> {
        Ok(self
            .parse_list(|p| p.parse_store_path(store_dir))?
            .into_iter()
            .collect())
    }

    fn parse_env(&mut self) -> Result<BTreeMap<String, String>, ATermError> {
        let entries = self.parse_list(|p| {
            p.expect_char('(')?;
            let key = p.parse_string()?;
            p.expect_char(',')?;
            let value = p.parse_string()?;
            p.expect_char(')')?;
            Ok((key, value))
        })?;
        Ok(entries.into_iter().collect())
    }
}

fn decode_output_fields(
    store_dir: &StoreDir,
    path: &str,
    method: &str,
    hash: &str,
) -> Result<DerivationOutput, ATermError> {
    if method.is_empty() {
        if path.is_empty() {
            return Ok(DerivationOutput::Deferred);
        }
        return Ok(DerivationOutput::InputAddressed(
            store_dir.parse_path(path)?,
        ));
    }

    let method: ContentAddressMethodAlgorithm = method
        .parse()
        .map_err(|e| ATermError::InvalidOutput(format!("bad method: {e}")))?;

    if hash == "impure" {
        if !path.is_empty() {
            return Err(ATermError::InvalidOutput(
                "impure output must not declare a path".into(),
            ));
        }
        return Ok(DerivationOutput::Impure(method));
    }
    if hash.is_empty() {
        if !path.is_empty() {
            return Err(ATermError::InvalidOutput(
                "floating output must not declare a path".into(),
            ));
        }
        return Ok(DerivationOutput::CaFloating(method));
    }

    let hash = Hash::parse_digest(method.algorithm(), hash)
        .map_err(|e| ATermError::InvalidOutput(format!("bad hash: {e}")))?;
    let ca = match method {
        ContentAddressMethodAlgorithm::Text => ContentAddress::Text { hash },
        ContentAddressMethodAlgorithm::Flat(_) => ContentAddress::Fixed {
            method: crate::content_address::FileIngestionMethod::Flat,
            hash,
        },
        ContentAddressMethodAlgorithm::Recursive(_) => ContentAddress::Fixed {
            method: crate::content_address::FileIngestionMethod::Recursive,
            hash,
        },
    };
    Ok(DerivationOutput::CaFixed(ca))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derivation::DerivationOptions;

    fn sample() -> (StoreDir, Derivation) {
        let store_dir = StoreDir::default();
        let out_path: StorePath = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-sample".parse().unwrap();
        let input_drv: StorePath = "zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz-dep.drv".parse().unwrap();
        let input_src: StorePath = "bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb-src".parse().unwrap();

        let mut outputs = DerivationOutputs::new();
        outputs.insert(
            OutputName::default(),
            DerivationOutput::InputAddressed(out_path),
        );

        let mut input_drvs = BTreeMap::new();
        input_drvs.insert(input_drv, BTreeSet::from([OutputName::default()]));

        let mut env = BTreeMap::new();
        env.insert("escape\"me".to_string(), "line1\nline2\ttab".to_string());
        env.insert("name".to_string(), "sample".to_string());

        let drv = Derivation {
            name: "sample".parse().unwrap(),
            outputs,
            input_srcs: BTreeSet::from([input_src]),
            input_drvs,
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            args: vec!["-c".into(), "echo hi > $out".into()],
            env,
            options: DerivationOptions::default(),
            structured_attrs: None,
        };
        (store_dir, drv)
    }

    #[test]
    fn test_unparse_shape() {
        let (store_dir, drv) = sample();
        let text = unparse(&store_dir, &drv).unwrap();
        assert!(text.starts_with("Derive(["));
        assert!(text.ends_with(")"));
        assert!(text.contains("\"/nix/store/aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa-sample\""));
        assert!(text.contains("\\n"));
        assert!(text.contains("\\\""));
    }

    #[test]
    fn test_roundtrip() {
        let (store_dir, drv) = sample();
        let text = unparse(&store_dir, &drv).unwrap();
        let parsed = parse(&store_dir, &text, "sample").unwrap();
        assert_eq!(parsed, drv);
        // And the round-tripped text is byte-identical (stable identity).
        assert_eq!(unparse(&store_dir, &parsed).unwrap(), text);
    }

    #[test]
    fn test_roundtrip_output_variants() {
        let (store_dir, mut drv) = sample();
        drv.outputs.insert(
            "fixed".parse().unwrap(),
            DerivationOutput::CaFixed(
                "fixed:r:sha256:248d6a61d20638b8e5c026930c3e6039a33ce45964ff2167f6ecedd419db06c1"
                    .parse()
                    .unwrap(),
            ),
        );
        drv.outputs.insert(
            "floating".parse().unwrap(),
            DerivationOutput::CaFloating(
                "r:sha256".parse::<ContentAddressMethodAlgorithm>().unwrap(),
            ),
        );
        drv.outputs
            .insert("deferred".parse().unwrap(), DerivationOutput::Deferred);

        let text = unparse(&store_dir, &drv).unwrap();
        let parsed = parse(&store_dir, &text, "sample").unwrap();
        assert_eq!(parsed.outputs, drv.outputs);
    }

    #[test]
    fn test_structured_attrs_in_identity() {
        let (store_dir, mut drv) = sample();
        let plain = unparse(&store_dir, &drv).unwrap();

        let mut attrs = serde_json::Map::new();
        attrs.insert("myAttr".into(), serde_json::Value::String("v".into()));
        drv.structured_attrs = Some(StructuredAttrs { attrs });

        let structured = unparse(&store_dir, &drv).unwrap();
        assert_ne!(plain, structured);

        let parsed = parse(&store_dir, &structured, "sample").unwrap();
        assert_eq!(parsed.structured_attrs, drv.structured_attrs);
        assert!(!parsed.env.contains_key(STRUCTURED_ATTRS_KEY));
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let (store_dir, drv) = sample();
        let text = unparse(&store_dir, &drv).unwrap();
        let truncated = &text[..text.len() - 2];
        assert!(parse(&store_dir, truncated, "sample").is_err());
    }
}
