//! Sandbox mount directives and the command they compile into.
//!
//! Directives are append-only and order-significant: for a given
//! destination, the last directive appended wins. A list is closed by
//! [`DirectiveList::terminate`], which consumes it, so nothing can follow
//! the exec marker.

use std::fmt;
use std::path::{Path, PathBuf};

/// How a bind exposes its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    ReadOnly,
    ReadWrite,
    Device,
}

/// One sandbox mount or namespace directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Namespace or session option without operands.
    Flag(&'static str),
    /// Bind `source` to `dest`. `optional` binds are skipped when the source is missing.
    Bind {
        mode: BindMode,
        optional: bool,
        source: PathBuf,
        dest: PathBuf,
    },
    /// Mask `dest` with an empty tmpfs.
    Tmpfs { dest: PathBuf, perms: Option<u32> },
    /// Read-only overlay of `sources` mounted at `dest`.
    Overlay { sources: Vec<PathBuf>, dest: PathBuf },
    Symlink { target: PathBuf, link: PathBuf },
    Dir(PathBuf),
    Proc(PathBuf),
    Dev(PathBuf),
    Mqueue(PathBuf),
}

impl Directive {
    pub fn bind(mode: BindMode, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Directive::Bind {
            mode,
            optional: false,
            source: source.into(),
            dest: dest.into(),
        }
    }

    pub fn bind_try(mode: BindMode, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> Self {
        Directive::Bind {
            mode,
            optional: true,
            source: source.into(),
            dest: dest.into(),
        }
    }

    /// Destination path this directive affects, if any.
    pub fn dest(&self) -> Option<&Path> {
        match self {
            Directive::Flag(_) => None,
            Directive::Bind { dest, .. }
            | Directive::Tmpfs { dest, .. }
            | Directive::Overlay { dest, .. } => Some(dest),
            Directive::Symlink { link, .. } => Some(link),
            Directive::Dir(p) | Directive::Proc(p) | Directive::Dev(p) | Directive::Mqueue(p) => {
                Some(p)
            }
        }
    }

    fn render(&self, out: &mut Vec<String>) {
        let s = |p: &Path| p.to_string_lossy().into_owned();
        match self {
            Directive::Flag(flag) => out.push((*flag).to_string()),
            Directive::Bind {
                mode,
                optional,
                source,
                dest,
            } => {
                let opt = match (mode, optional) {
                    (BindMode::ReadOnly, false) => "--ro-bind",
                    (BindMode::ReadOnly, true) => "--ro-bind-try",
                    (BindMode::ReadWrite, false) => "--bind",
                    (BindMode::ReadWrite, true) => "--bind-try",
                    (BindMode::Device, false) => "--dev-bind",
                    (BindMode::Device, true) => "--dev-bind-try",
                };
                out.extend([opt.to_string(), s(source), s(dest)]);
            }
            Directive::Tmpfs { dest, perms } => {
                if let Some(perms) = perms {
                    out.extend(["--perms".to_string(), format!("{perms:04o}")]);
                }
                out.extend(["--tmpfs".to_string(), s(dest)]);
            }
            Directive::Overlay { sources, dest } => {
                for src in sources {
                    out.extend(["--overlay-src".to_string(), s(src)]);
                }
                out.extend(["--ro-overlay".to_string(), s(dest)]);
            }
            Directive::Symlink { target, link } => {
                out.extend(["--symlink".to_string(), s(target), s(link)]);
            }
            Directive::Dir(p) => out.extend(["--dir".to_string(), s(p)]),
            Directive::Proc(p) => out.extend(["--proc".to_string(), s(p)]),
            Directive::Dev(p) => out.extend(["--dev".to_string(), s(p)]),
            Directive::Mqueue(p) => out.extend(["--mqueue".to_string(), s(p)]),
        }
    }
}

/// Append-only, ordered list of directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveList {
    items: Vec<Directive>,
}

impl DirectiveList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, directive: Directive) -> &mut Self {
        self.items.push(directive);
        self
    }

    /// Append another list after everything already present.
    pub fn append(&mut self, other: DirectiveList) -> &mut Self {
        self.items.extend(other.items);
        self
    }

    pub fn flag(&mut self, flag: &'static str) -> &mut Self {
        self.push(Directive::Flag(flag))
    }

    pub fn ro_bind(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind(BindMode::ReadOnly, source, dest))
    }

    pub fn ro_bind_try(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind_try(BindMode::ReadOnly, source, dest))
    }

    pub fn rw_bind(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind(BindMode::ReadWrite, source, dest))
    }

    pub fn rw_bind_try(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind_try(BindMode::ReadWrite, source, dest))
    }

    pub fn dev_bind(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind(BindMode::Device, source, dest))
    }

    pub fn dev_bind_try(&mut self, source: impl Into<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::bind_try(BindMode::Device, source, dest))
    }

    /// Device bind of a path onto itself.
    pub fn expose_device(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        let path = path.into();
        self.dev_bind(path.clone(), path)
    }

    pub fn tmpfs(&mut self, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Tmpfs {
            dest: dest.into(),
            perms: None,
        })
    }

    /// tmpfs with explicit permission bits, e.g. 0o000 to hide a directory.
    pub fn tmpfs_with_perms(&mut self, dest: impl Into<PathBuf>, perms: u32) -> &mut Self {
        self.push(Directive::Tmpfs {
            dest: dest.into(),
            perms: Some(perms),
        })
    }

    pub fn overlay(&mut self, sources: Vec<PathBuf>, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Overlay {
            sources,
            dest: dest.into(),
        })
    }

    pub fn symlink(&mut self, target: impl Into<PathBuf>, link: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Symlink {
            target: target.into(),
            link: link.into(),
        })
    }

    pub fn dir(&mut self, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Dir(dest.into()))
    }

    pub fn proc(&mut self, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Proc(dest.into()))
    }

    pub fn dev(&mut self, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Dev(dest.into()))
    }

    pub fn mqueue(&mut self, dest: impl Into<PathBuf>) -> &mut Self {
        self.push(Directive::Mqueue(dest.into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Directive> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The directive that decides what ends up at `dest`.
    pub fn effective(&self, dest: impl AsRef<Path>) -> Option<&Directive> {
        effective_in(&self.items, dest.as_ref())
    }

    /// Close the list with the exec marker.
    pub fn terminate(self, exec: Vec<String>) -> SandboxCommand {
        SandboxCommand {
            directives: self.items,
            exec,
        }
    }
}

impl FromIterator<Directive> for DirectiveList {
    fn from_iter<I: IntoIterator<Item = Directive>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

fn effective_in<'a>(items: &'a [Directive], dest: &Path) -> Option<&'a Directive> {
    items.iter().rev().find(|d| d.dest() == Some(dest))
}

/// A terminated directive list: the sandbox arguments followed by the exec target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    directives: Vec<Directive>,
    exec: Vec<String>,
}

impl SandboxCommand {
    pub fn directives(&self) -> &[Directive] {
        &self.directives
    }

    pub fn exec(&self) -> &[String] {
        &self.exec
    }

    pub fn effective(&self, dest: impl AsRef<Path>) -> Option<&Directive> {
        effective_in(&self.directives, dest.as_ref())
    }

    /// Flat argument vector for the sandboxing tool.
    pub fn args(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.directives.len() * 3 + self.exec.len() + 1);
        for directive in &self.directives {
            directive.render(&mut out);
        }
        out.push("--".to_string());
        out.extend(self.exec.iter().cloned());
        out
    }
}

impl fmt::Display for SandboxCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.args().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn later_directive_wins_for_same_dest() {
        let mut list = DirectiveList::new();
        list.tmpfs("/dev/dri").expose_device("/dev/dri/card0").tmpfs("/sys/class/drm");
        list.dev_bind("/dev/dri", "/dev/dri");

        let effective = list.effective("/dev/dri").unwrap();
        assert_eq!(
            effective,
            &Directive::bind(BindMode::Device, "/dev/dri", "/dev/dri")
        );
        assert!(list.effective("/nowhere").is_none());
    }

    #[test]
    fn exec_marker_is_last() {
        let mut list = DirectiveList::new();
        list.flag("--unshare-pid").ro_bind("/etc", "/etc");
        let cmd = list.terminate(vec!["/usr/lib/portable/helper".to_string()]);

        let args = cmd.args();
        let marker = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(&args[marker + 1..], ["/usr/lib/portable/helper"]);
        assert_eq!(
            &args[..marker],
            ["--unshare-pid", "--ro-bind", "/etc", "/etc"]
        );
    }

    #[test]
    fn renders_each_directive_kind() {
        let mut list = DirectiveList::new();
        list.tmpfs_with_perms("/boot", 0)
            .overlay(vec!["/usr/bin".into(), "/usr/lib/portable/overlay-usr".into()], "/usr/bin")
            .symlink("/usr/lib", "/lib")
            .rw_bind_try("/tmp/.X11-unix", "/tmp/.X11-unix")
            .dev_bind_try("/dev/ntsync", "/dev/ntsync")
            .mqueue("/dev/mqueue");
        let args = list.terminate(vec![]).args();
        assert_eq!(
            args,
            [
                "--perms",
                "0000",
                "--tmpfs",
                "/boot",
                "--overlay-src",
                "/usr/bin",
                "--overlay-src",
                "/usr/lib/portable/overlay-usr",
                "--ro-overlay",
                "/usr/bin",
                "--symlink",
                "/usr/lib",
                "/lib",
                "--bind-try",
                "/tmp/.X11-unix",
                "/tmp/.X11-unix",
                "--dev-bind-try",
                "/dev/ntsync",
                "/dev/ntsync",
                "--mqueue",
                "/dev/mqueue",
                "--",
            ]
        );
    }

    #[test]
    fn effective_survives_termination() {
        let mut list = DirectiveList::new();
        list.tmpfs("/sys/class/drm");
        list.dev_bind("/sys/class/drm/card1", "/sys/class/drm/card1");
        let cmd = list.terminate(vec!["true".into()]);
        assert!(matches!(
            cmd.effective("/sys/class/drm"),
            Some(Directive::Tmpfs { .. })
        ));
        assert_eq!(cmd.exec(), ["true"]);
    }
}
