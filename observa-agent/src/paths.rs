use std::path::{Path, PathBuf};

pub const AGENT_SOCKET: &str = "agent.sock";

pub fn observa_root(home: &Path) -> PathBuf {
    home.join(".observa")
}

pub fn data_dir(home: &Path) -> PathBuf {
    observa_root(home).join("data")
}

pub fn socket_path(home: &Path) -> PathBuf {
    observa_root(home).join(AGENT_SOCKET)
}
