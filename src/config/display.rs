//! Startup configuration dashboard, printed once when the binary boots.

use std::fmt;

use super::{AppConfig, LocationConfig, ServerConfig};

impl fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "  ───────────────────────────────────────────────")?;
        writeln!(
            f,
            "  ⦿ listen:       {}:{}",
            self.bind_host(),
            self.listen
        )?;
        writeln!(
            f,
            "  ⦿ server_names: {}",
            if self.server_names.is_empty() {
                "_".to_string()
            } else {
                self.server_names.join(", ")
            }
        )?;
        writeln!(f, "  ⦿ default:      {}", self.default_server)?;
        writeln!(f, "  ⦿ root:         {}", self.root)?;
        writeln!(
            f,
            "  ⦿ body limit:   {} KiB",
            self.effective_body_limit() / 1024
        )?;
        if !self.error_page.is_empty() {
            writeln!(f, "  ⦿ error pages:")?;
            for (code, path) in &self.error_page {
                writeln!(f, "      {code} -> {path}")?;
            }
        }
        writeln!(f, "\n  locations ({})", self.locations.len())?;
        writeln!(f, "  ───────────────────────────────────────────────")?;
        for (idx, location) in self.locations.iter().enumerate() {
            let last = idx == self.locations.len() - 1;
            let branch = if last { "  └──" } else { "  ├──" };
            writeln!(f, "{branch} {}", location)?;
        }
        Ok(())
    }
}

impl fmt::Display for LocationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        if let Some(alias) = &self.alias {
            write!(f, " alias={alias}")?;
        } else if let Some(root) = &self.root {
            write!(f, " root={root}")?;
        }
        if self.autoindex {
            write!(f, " autoindex")?;
        }
        if !self.cgi_ext.is_empty() {
            write!(f, " cgi={:?}", self.cgi_ext)?;
        }
        if let Some(ret) = &self.r#return {
            write!(f, " return={}->{}", ret.code, ret.url)?;
        }
        Ok(())
    }
}

pub fn print_dashboard(config: &AppConfig) {
    println!("╔══════════════════════════════════════════════╗");
    println!("║  webserv configuration ({} server block{})", config.servers.len(), if config.servers.len() == 1 { "" } else { "s" });
    println!("╚══════════════════════════════════════════════╝");
    for server in &config.servers {
        println!("{server}");
    }
}
