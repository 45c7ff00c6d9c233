//! File tree requests as carried on the wire.
//!
//! A request is the first message of an RPC stream: a `Dir` whose `op`
//! names the operation. `path`, `off`, `count`, `newpath` and `all` are
//! arguments; every other attribute is metadata for the operation.

use skein_proto::Dir;

use crate::SrvError;

const ARG_KEYS: [&str; 6] = ["op", "path", "off", "count", "newpath", "all"];

/// One file tree request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Attributes of a file
    Stat {
        /// File
        path: String,
    },
    /// Attributes of every entry in a directory
    Getdir {
        /// Directory
        path: String,
    },
    /// File data
    Get {
        /// File
        path: String,
        /// Starting offset
        off: u64,
        /// Bytes wanted, negative for all
        count: i64,
    },
    /// Store file data, sent after the request
    Put {
        /// File
        path: String,
        /// Starting offset
        off: u64,
        /// File attributes
        meta: Dir,
    },
    /// Create a directory
    Mkdir {
        /// Directory
        path: String,
        /// Directory attributes
        meta: Dir,
    },
    /// Remove a file
    Remove {
        /// File
        path: String,
        /// Remove directory contents too
        all: bool,
    },
    /// Move a file
    Move {
        /// File
        path: String,
        /// New path
        new_path: String,
    },
    /// Update attributes
    Wstat {
        /// File
        path: String,
        /// New attributes
        meta: Dir,
    },
}

impl Request {
    /// Operation name.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Stat { .. } => "stat",
            Request::Getdir { .. } => "getdir",
            Request::Get { .. } => "get",
            Request::Put { .. } => "put",
            Request::Mkdir { .. } => "mkdir",
            Request::Remove { .. } => "remove",
            Request::Move { .. } => "move",
            Request::Wstat { .. } => "wstat",
        }
    }

    /// Path the request is about.
    pub fn path(&self) -> &str {
        match self {
            Request::Stat { path }
            | Request::Getdir { path }
            | Request::Get { path, .. }
            | Request::Put { path, .. }
            | Request::Mkdir { path, .. }
            | Request::Remove { path, .. }
            | Request::Move { path, .. }
            | Request::Wstat { path, .. } => path,
        }
    }

    /// Encodes the request.
    pub fn to_dir(&self) -> Dir {
        let mut d = match self {
            Request::Put { meta, .. } | Request::Mkdir { meta, .. } | Request::Wstat { meta, .. } => {
                let mut d = Dir::new();
                for (k, v) in meta.iter().filter(|(k, _)| !ARG_KEYS.contains(k)) {
                    d.set(k, v);
                }
                d
            }
            _ => Dir::new(),
        };
        d.set("op", self.op());
        d.set("path", self.path());
        match self {
            Request::Get { off, count, .. } => {
                d.set("off", off.to_string());
                d.set("count", count.to_string());
            }
            Request::Put { off, .. } => d.set("off", off.to_string()),
            Request::Remove { all, .. } => d.set("all", if *all { "y" } else { "n" }),
            Request::Move { new_path, .. } => d.set("newpath", new_path.as_str()),
            _ => {}
        }
        d
    }

    /// Decodes a request.
    pub fn from_dir(d: &Dir) -> Result<Self, SrvError> {
        let path = d.get("path");
        if path.is_empty() {
            return Err(SrvError::BadRequest(format!("no path in {}", d)));
        }
        let path = path.to_string();
        let meta = || {
            let mut m = Dir::new();
            for (k, v) in d.iter().filter(|(k, _)| !ARG_KEYS.contains(k)) {
                m.set(k, v);
            }
            m
        };
        let req = match d.get("op") {
            "stat" => Request::Stat { path },
            "getdir" => Request::Getdir { path },
            "get" => Request::Get {
                path,
                off: number(d, "off", 0)?,
                count: number(d, "count", -1)?,
            },
            "put" => Request::Put {
                path,
                off: number(d, "off", 0)?,
                meta: meta(),
            },
            "mkdir" => Request::Mkdir { path, meta: meta() },
            "remove" => Request::Remove {
                path,
                all: d.get("all") == "y",
            },
            "move" => {
                let new_path = d.get("newpath");
                if new_path.is_empty() {
                    return Err(SrvError::BadRequest(format!("move {}: no newpath", path)));
                }
                Request::Move {
                    path,
                    new_path: new_path.to_string(),
                }
            }
            "wstat" => Request::Wstat { path, meta: meta() },
            other => return Err(SrvError::BadRequest(format!("unknown op '{}'", other))),
        };
        Ok(req)
    }
}

fn number<T: std::str::FromStr>(d: &Dir, key: &str, default: T) -> Result<T, SrvError> {
    match d.get(key) {
        "" => Ok(default),
        s => s
            .parse()
            .map_err(|_| SrvError::BadRequest(format!("bad {} '{}'", key, s))),
    }
}
