//! execve: path and interpreter resolution. The actual reload happens in
//! the execution loop, which owns the loader and the JIT.

use arena::state::CpuState;
use arena::Arena;

use crate::defs::errno;
use crate::{Kernel, Outcome};
use vfs::NodeKind;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const MAX_SCRIPT_DEPTH: usize = 4;

/// A resolved execve, handed to the loader glue.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub path: String,
    pub argv: Vec<String>,
    pub envp: Vec<String>,
}

impl Kernel {
    pub(crate) fn sys_execve(&mut self, cpu: &mut CpuState, arena: &mut Arena) -> Outcome {
        let path = match arena.read_cstr(cpu.get_x(10)) {
            Ok(p) => p,
            Err(_) => {
                self.ret(cpu, -errno::EFAULT);
                return Outcome::Done;
            }
        };
        let argv = arena.read_str_vec(cpu.get_x(11)).unwrap_or_default();
        let envp = arena.read_str_vec(cpu.get_x(12)).unwrap_or_default();

        match self.resolve_exec(&path, argv, &envp) {
            Ok((path, argv)) => {
                tracing::debug!(path, ?argv, "execve");
                self.exec_request = Some(ExecRequest { path, argv, envp });
                // On success the old pc is meaningless; the loader sets a
                // fresh one before execution resumes.
                Outcome::ExecRestart
            }
            Err(e) => {
                self.ret(cpu, e);
                Outcome::Done
            }
        }
    }

    /// Follows `#!` interpreter lines (rewriting argv as the kernel does)
    /// and resolves `/usr/bin/env CMD` through PATH.
    pub fn resolve_exec(
        &mut self,
        path: &str,
        mut argv: Vec<String>,
        envp: &[String],
    ) -> Result<(String, Vec<String>), i64> {
        let mut path = path.to_string();
        for _ in 0..MAX_SCRIPT_DEPTH {
            let node = self.vfs.resolve(&path).map_err(|e| Self::vfs_errno(&e))?;
            let n = self.vfs.node(node);
            if n.kind == NodeKind::Directory {
                return Err(-errno::EISDIR);
            }
            if n.kind != NodeKind::Regular {
                return Err(-errno::EACCES);
            }
            let content = &n.content;
            if !content.starts_with(b"#!") {
                return Ok((self.vfs.normalize(&path), argv));
            }

            // Shebang: rewrite argv to run the interpreter on the script.
            let line_end = content.iter().position(|&b| b == b'\n').unwrap_or(content.len());
            let line = String::from_utf8_lossy(&content[2..line_end]).trim().to_string();
            let mut parts = line.splitn(2, char::is_whitespace);
            let interp = parts.next().unwrap_or("").to_string();
            let arg = parts.next().map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
            if interp.is_empty() {
                return Err(-errno::ENOENT);
            }

            let script = self.vfs.normalize(&path);
            let rest: Vec<String> = argv.drain(..).skip(1).collect();

            if interp == "/usr/bin/env" {
                let Some(cmd) = arg else {
                    return Err(-errno::ENOENT);
                };
                let resolved = self.search_path(&cmd, envp)?;
                argv = vec![cmd];
                argv.push(script);
                argv.extend(rest);
                path = resolved;
            } else {
                let mut next_argv = vec![interp.clone()];
                if let Some(a) = arg {
                    next_argv.push(a);
                }
                next_argv.push(script);
                next_argv.extend(rest);
                argv = next_argv;
                path = interp;
            }
        }
        Err(-errno::ELOOP)
    }

    fn search_path(&self, cmd: &str, envp: &[String]) -> Result<String, i64> {
        if cmd.contains('/') {
            return Ok(cmd.to_string());
        }
        let path_var = envp
            .iter()
            .find_map(|e| e.strip_prefix("PATH="))
            .unwrap_or(DEFAULT_PATH);
        for dir in path_var.split(':').filter(|d| !d.is_empty()) {
            let candidate = format!("{dir}/{cmd}");
            if let Ok(id) = self.vfs.resolve(&candidate) {
                if self.vfs.node(id).kind == NodeKind::Regular {
                    return Ok(candidate);
                }
            }
        }
        Err(-errno::ENOENT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs::{Node, Vfs};

    fn kernel_with_scripts() -> Kernel {
        let mut vfs = Vfs::new();
        vfs.mkdir_all("/bin").unwrap();
        vfs.mkdir_all("/usr/bin").unwrap();
        vfs.create_at("/bin/busybox", Node::regular(0o755, b"\x7fELF....".to_vec()))
            .unwrap();
        vfs.create_at(
            "/bin/hello.sh",
            Node::regular(0o755, b"#!/bin/busybox sh\necho hi\n".to_vec()),
        )
        .unwrap();
        vfs.create_at(
            "/bin/via-env",
            Node::regular(0o755, b"#!/usr/bin/env busybox\n".to_vec()),
        )
        .unwrap();
        Kernel::new(vfs, "test", 50_000)
    }

    #[test]
    fn plain_elf_passes_through() {
        let mut k = kernel_with_scripts();
        let (path, argv) = k
            .resolve_exec("/bin/busybox", vec!["busybox".into(), "ls".into()], &[])
            .unwrap();
        assert_eq!(path, "/bin/busybox");
        assert_eq!(argv, vec!["busybox", "ls"]);
    }

    #[test]
    fn shebang_rewrites_argv() {
        let mut k = kernel_with_scripts();
        let (path, argv) = k
            .resolve_exec("/bin/hello.sh", vec!["hello.sh".into(), "-x".into()], &[])
            .unwrap();
        assert_eq!(path, "/bin/busybox");
        assert_eq!(argv, vec!["/bin/busybox", "sh", "/bin/hello.sh", "-x"]);
    }

    #[test]
    fn env_shebang_searches_path() {
        let mut k = kernel_with_scripts();
        let envp = vec!["PATH=/nowhere:/bin".to_string()];
        let (path, argv) = k
            .resolve_exec("/bin/via-env", vec!["via-env".into()], &envp)
            .unwrap();
        assert_eq!(path, "/bin/busybox");
        assert_eq!(argv, vec!["busybox", "/bin/via-env"]);
    }

    #[test]
    fn missing_binary_is_enoent() {
        let mut k = kernel_with_scripts();
        let err = k.resolve_exec("/bin/nope", vec![], &[]).unwrap_err();
        assert_eq!(err, -errno::ENOENT);
    }
}
