//! Source resolution: DSO + offset -> file:line via `addr2line`.
//!
//! The controller merges every dispatcher's DSO->offsets map (offset
//! sets are unioned per DSO, so each DSO is resolved exactly once) and
//! hands the result here. Tasks run on a bounded worker pool; each task
//! drives one `addr2line -e <dso>` child over its stdin/stdout, one
//! offset per line.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::warn;
use serde_json::{json, Map, Value};

use crate::cpu::{apply_affinity, CpuConfig};
use crate::store::Store;

/// Resolver output: the `sources.json` object plus every file path an
/// offset resolved to.
#[derive(Debug, Default)]
pub struct ResolvedSources {
    /// DSO path -> { offset -> {file, line} }.
    pub json: Map<String, Value>,
    pub files: HashSet<PathBuf>,
}

impl ResolvedSources {
    /// The file paths that actually exist on this machine, for the host.
    pub fn existing_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .files
            .iter()
            .filter(|p| p.exists())
            .cloned()
            .collect();
        files.sort();
        files
    }
}

pub struct SourceResolver {
    pool_size: usize,
    cpu: CpuConfig,
    binary: PathBuf,
}

impl SourceResolver {
    /// The pool stays at one worker by default: a concurrently torn-down
    /// addr2line can survive its closed stdin.
    pub fn new(pool_size: usize, cpu: CpuConfig) -> Self {
        SourceResolver {
            pool_size: pool_size.max(1),
            cpu,
            binary: PathBuf::from("addr2line"),
        }
    }

    #[cfg(test)]
    fn with_binary(mut self, binary: PathBuf) -> Self {
        self.binary = binary;
        self
    }

    /// Resolve every (DSO, offset set) pair and aggregate the results.
    pub fn resolve(&self, dso_offsets: HashMap<String, BTreeSet<String>>) -> ResolvedSources {
        let (task_tx, task_rx) = mpsc::channel::<(String, BTreeSet<String>)>();
        let (result_tx, result_rx) = mpsc::channel();
        let task_rx = Arc::new(Mutex::new(task_rx));

        let mut workers = Vec::with_capacity(self.pool_size);
        for _ in 0..self.pool_size {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let binary = self.binary.clone();
            let cpus = self.cpu.profiler_cpus().to_vec();

            workers.push(std::thread::spawn(move || loop {
                let task = {
                    let rx = task_rx.lock().unwrap();
                    rx.recv()
                };
                let (dso, offsets) = match task {
                    Ok(task) => task,
                    Err(_) => break,
                };

                match resolve_dso(&binary, &cpus, &dso, &offsets) {
                    Ok((resolved, files)) => {
                        let _ = result_tx.send((dso, resolved, files));
                    }
                    Err(e) => {
                        warn!("Resolving source locations for {} failed: {}", dso, e);
                        let _ = result_tx.send((dso, Map::new(), HashSet::new()));
                    }
                }
            }));
        }
        drop(result_tx);

        for entry in dso_offsets {
            let _ = task_tx.send(entry);
        }
        drop(task_tx);

        let mut output = ResolvedSources::default();
        for (dso, resolved, files) in result_rx {
            output.json.insert(dso, Value::Object(resolved));
            output.files.extend(files);
        }

        for worker in workers {
            let _ = worker.join();
        }

        output
    }
}

/// Drive one addr2line child over the offset set of a single DSO.
fn resolve_dso(
    binary: &PathBuf,
    cpus: &[usize],
    dso: &str,
    offsets: &BTreeSet<String>,
) -> Result<(Map<String, Value>, HashSet<PathBuf>)> {
    use std::os::unix::process::CommandExt;

    let mut cmd = Command::new(binary);
    cmd.arg("-e")
        .arg(dso)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    {
        let cpus = cpus.to_vec();
        unsafe {
            cmd.pre_exec(move || apply_affinity(&cpus));
        }
    }
    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning {} for {}", binary.display(), dso))?;

    let mut stdin = child.stdin.take().context("opening addr2line stdin")?;
    let stdout = child.stdout.take().context("opening addr2line stdout")?;
    let mut reader = BufReader::new(stdout);

    let mut resolved = Map::new();
    let mut files = HashSet::new();

    for offset in offsets {
        writeln!(stdin, "{}", offset)?;
        stdin.flush()?;

        let mut reply = String::new();
        if reader.read_line(&mut reply)? == 0 {
            break;
        }

        if let Some((file, line)) = parse_reply(reply.trim_end()) {
            files.insert(PathBuf::from(&file));
            resolved.insert(offset.clone(), json!({"file": file, "line": line}));
        }
    }

    drop(stdin);
    let _ = child.wait();

    Ok((resolved, files))
}

/// An addr2line reply is only usable when it splits on ":" into exactly
/// a file part and a numeric line part; anything else ("??:0" with a
/// non-numeric line, discriminator suffixes, extra colons) is skipped.
fn parse_reply(reply: &str) -> Option<(String, i64)> {
    let parts: Vec<&str> = reply.split(':').collect();
    if parts.len() != 2 {
        return None;
    }
    let line = parts[1].trim().parse::<i64>().ok()?;
    Some((parts[0].to_string(), line))
}

/// Write the aggregated `sources.json` artifact into the node directory.
pub fn write_sources_json(store: &Store, sources: &Map<String, Value>) -> Result<()> {
    let mut file = store.create_file("sources.json")?;
    serde_json::to_writer(&mut file, &Value::Object(sources.clone()))?;
    file.write_all(b"\n")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn fake_addr2line(dir: &std::path::Path, body: &str) -> PathBuf {
        let path = dir.join("fake-addr2line");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_parse_reply() {
        assert_eq!(parse_reply("/src/main.c:42"), Some(("/src/main.c".to_string(), 42)));
        assert_eq!(parse_reply("??:0"), Some(("??".to_string(), 0)));
        assert_eq!(parse_reply("??:?"), None);
        assert_eq!(parse_reply("no colon here"), None);
        assert_eq!(parse_reply("a:b:c"), None);
        assert_eq!(parse_reply("/src/main.c:12 (discriminator 2)"), None);
    }

    #[test]
    fn test_resolve_with_fake_addr2line() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_addr2line(
            dir.path(),
            "while read line; do echo \"/tmp/src.c:42\"; done",
        );

        let mut input = HashMap::new();
        input.insert(
            "/lib/libfoo.so".to_string(),
            BTreeSet::from(["0x1".to_string(), "0x2".to_string()]),
        );

        let resolver = SourceResolver::new(1, CpuConfig::all()).with_binary(bin);
        let out = resolver.resolve(input);

        let dso = &out.json["/lib/libfoo.so"];
        assert_eq!(dso["0x1"]["file"], "/tmp/src.c");
        assert_eq!(dso["0x1"]["line"], 42);
        assert_eq!(dso["0x2"]["line"], 42);
        assert!(out.files.contains(&PathBuf::from("/tmp/src.c")));
        // /tmp/src.c does not exist, so nothing is reported to the host.
        assert!(out.existing_files().is_empty());
    }

    #[test]
    fn test_unparseable_replies_contribute_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_addr2line(dir.path(), "while read line; do echo \"??:?\"; done");

        let mut input = HashMap::new();
        input.insert(
            "/lib/libbar.so".to_string(),
            BTreeSet::from(["0x10".to_string()]),
        );

        let resolver = SourceResolver::new(1, CpuConfig::all()).with_binary(bin);
        let out = resolver.resolve(input);

        assert_eq!(out.json["/lib/libbar.so"], json!({}));
        assert!(out.files.is_empty());
    }

    #[test]
    fn test_write_sources_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let mut sources = Map::new();
        sources.insert("/lib/x.so".to_string(), json!({"0x1": {"file": "f.c", "line": 1}}));

        write_sources_json(&store, &sources).unwrap();

        let contents = std::fs::read_to_string(dir.path().join("sources.json")).unwrap();
        let parsed: Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["/lib/x.so"]["0x1"]["line"], 1);
    }
}
