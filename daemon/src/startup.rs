/// Start-at-login registration, the daemon's equivalent of a desktop app's
/// "open at login" setting.
///
///   - Windows: a `Pairkiller` value under `HKCU\...\CurrentVersion\Run`.
///   - macOS: a LaunchAgent plist in `~/Library/LaunchAgents`.
///   - Linux and other XDG desktops: a `.desktop` file in `$XDG_CONFIG_HOME/autostart`.
///
/// Registering again overwrites the stored command; unregistering an entry
/// that does not exist succeeds.
use anyhow::{Context, Result};
use std::path::Path;
#[cfg(not(windows))]
use std::path::PathBuf;
use tracing::info;

const ENTRY_NAME: &str = "Pairkiller";
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
const LAUNCH_AGENT_LABEL: &str = "com.pairkiller.daemon";

/// Registers the running daemon binary to launch at user login.
pub fn register_startup() -> Result<()> {
    let exe = std::env::current_exe().context("Failed to locate daemon executable")?;
    let location = imp::register(&exe)?;
    info!(exe = %exe.display(), entry = %location, "Registered to start at login");
    Ok(())
}

/// Removes the login entry.  Backs `--unregister-startup`; an uninstaller can
/// call it too.
pub fn unregister_startup() -> Result<()> {
    let location = imp::unregister()?;
    info!(entry = %location, "Removed start-at-login entry");
    Ok(())
}

// ── Windows: HKCU Run key ──────────────────────────────────────────────────────

#[cfg(windows)]
mod imp {
    use super::ENTRY_NAME;
    use anyhow::{bail, Result};
    use std::path::Path;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{ERROR_FILE_NOT_FOUND, ERROR_SUCCESS, WIN32_ERROR};
    use windows::Win32::System::Registry::{
        RegCloseKey, RegCreateKeyExW, RegDeleteValueW, RegOpenKeyExW, RegSetValueExW, HKEY,
        HKEY_CURRENT_USER, KEY_SET_VALUE, REG_OPTION_NON_VOLATILE, REG_SZ,
    };

    const RUN_KEY: &str = r"Software\Microsoft\Windows\CurrentVersion\Run";

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// An open `Run` key, closed on drop.
    struct RunKey(HKEY);

    impl RunKey {
        fn create() -> Result<Self> {
            let path = wide(RUN_KEY);
            let mut hkey = HKEY::default();
            let status = unsafe {
                RegCreateKeyExW(
                    HKEY_CURRENT_USER,
                    PCWSTR::from_raw(path.as_ptr()),
                    0,
                    PCWSTR::null(),
                    REG_OPTION_NON_VOLATILE,
                    KEY_SET_VALUE,
                    None,
                    &mut hkey,
                    None,
                )
            };
            check("RegCreateKeyExW", status)?;
            Ok(Self(hkey))
        }

        /// `None` when the key itself is missing.
        fn open() -> Result<Option<Self>> {
            let path = wide(RUN_KEY);
            let mut hkey = HKEY::default();
            let status = unsafe {
                RegOpenKeyExW(
                    HKEY_CURRENT_USER,
                    PCWSTR::from_raw(path.as_ptr()),
                    0,
                    KEY_SET_VALUE,
                    &mut hkey,
                )
            };
            if status == ERROR_FILE_NOT_FOUND {
                return Ok(None);
            }
            check("RegOpenKeyExW", status)?;
            Ok(Some(Self(hkey)))
        }

        fn set(&self, command: &str) -> Result<()> {
            let name = wide(ENTRY_NAME);
            let data = wide(command);
            let bytes: Vec<u8> = data.iter().flat_map(|unit| unit.to_le_bytes()).collect();
            let status = unsafe {
                RegSetValueExW(self.0, PCWSTR::from_raw(name.as_ptr()), 0, REG_SZ, Some(bytes.as_slice()))
            };
            check("RegSetValueExW", status)
        }

        fn delete(&self) -> Result<()> {
            let name = wide(ENTRY_NAME);
            let status = unsafe { RegDeleteValueW(self.0, PCWSTR::from_raw(name.as_ptr())) };
            if status == ERROR_FILE_NOT_FOUND {
                return Ok(());
            }
            check("RegDeleteValueW", status)
        }
    }

    impl Drop for RunKey {
        fn drop(&mut self) {
            unsafe {
                let _ = RegCloseKey(self.0);
            }
        }
    }

    fn check(call: &str, status: WIN32_ERROR) -> Result<()> {
        if status != ERROR_SUCCESS {
            bail!("{call} failed: {status:?}");
        }
        Ok(())
    }

    pub fn register(exe: &Path) -> Result<String> {
        // Quoted so paths with spaces survive the shell's command-line split.
        RunKey::create()?.set(&format!("\"{}\"", exe.display()))?;
        Ok(format!(r"HKCU\{RUN_KEY}\{ENTRY_NAME}"))
    }

    pub fn unregister() -> Result<String> {
        if let Some(key) = RunKey::open()? {
            key.delete()?;
        }
        Ok(format!(r"HKCU\{RUN_KEY}\{ENTRY_NAME}"))
    }
}

// ── macOS and XDG: a file per entry ────────────────────────────────────────────

#[cfg(not(windows))]
mod imp {
    use super::{entry_contents, entry_path, remove_entry, write_entry};
    use anyhow::Result;
    use std::path::Path;

    pub fn register(exe: &Path) -> Result<String> {
        let path = entry_path()?;
        write_entry(&path, &entry_contents(exe))?;
        Ok(path.display().to_string())
    }

    pub fn unregister() -> Result<String> {
        let path = entry_path()?;
        remove_entry(&path)?;
        Ok(path.display().to_string())
    }
}

#[cfg(target_os = "macos")]
fn entry_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Home directory not found")?;
    Ok(home
        .join("Library")
        .join("LaunchAgents")
        .join(format!("{LAUNCH_AGENT_LABEL}.plist")))
}

#[cfg(target_os = "macos")]
fn entry_contents(exe: &Path) -> String {
    launch_agent_plist(exe)
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn entry_path() -> Result<PathBuf> {
    let config = dirs::config_dir().context("No per-user config directory on this platform")?;
    Ok(config
        .join("autostart")
        .join(format!("{}.desktop", ENTRY_NAME.to_lowercase())))
}

#[cfg(all(not(windows), not(target_os = "macos")))]
fn entry_contents(exe: &Path) -> String {
    autostart_desktop_entry(exe)
}

#[cfg_attr(windows, allow(dead_code))]
fn write_entry(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}

#[cfg_attr(windows, allow(dead_code))]
fn remove_entry(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

/// LaunchAgent that runs the daemon once per login session.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn launch_agent_plist(exe: &Path) -> String {
    let exe = exe
        .display()
        .to_string()
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;");
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{LAUNCH_AGENT_LABEL}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
    </array>
    <key>RunAtLoad</key>
    <true/>
</dict>
</plist>
"#
    )
}

/// XDG autostart entry; `Exec` is quoted the way freedesktop desktop entries require.
#[cfg_attr(any(windows, target_os = "macos"), allow(dead_code))]
fn autostart_desktop_entry(exe: &Path) -> String {
    let mut quoted = String::from("\"");
    for c in exe.display().to_string().chars() {
        if matches!(c, '"' | '`' | '$' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    format!(
        "[Desktop Entry]\nType=Application\nName={ENTRY_NAME}\nExec={quoted}\nX-GNOME-Autostart-enabled=true\nNoDisplay=true\n"
    )
}
