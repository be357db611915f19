// Script Generation
// Turns a list of shell commands into a traced DRONE_SCRIPT

use shell_escape::escape;
use std::borrow::Cow;

/// Environment variable carrying the generated script
pub const SCRIPT_VAR: &str = "DRONE_SCRIPT";

const POSIX_PREAMBLE: &str = r#"
if [ ! -z "${DRONE_NETRC_FILE}" ]; then
	echo $DRONE_NETRC_FILE > $HOME/.netrc
	chmod 600 $HOME/.netrc
fi

unset DRONE_SCRIPT
unset DRONE_NETRC_MACHINE
unset DRONE_NETRC_USERNAME
unset DRONE_NETRC_PASSWORD
unset DRONE_NETRC_FILE

set -e
"#;

const POWERSHELL_PREAMBLE: &str = r#"
$erroractionpreference = "stop"

if ($Env:DRONE_NETRC_MACHINE) {
@"
machine $Env:DRONE_NETRC_MACHINE
login $Env:DRONE_NETRC_USERNAME
password $Env:DRONE_NETRC_PASSWORD
"@ > (Join-Path $Env:USERPROFILE '_netrc');
}
[Environment]::SetEnvironmentVariable("DRONE_NETRC_USERNAME", $null);
[Environment]::SetEnvironmentVariable("DRONE_NETRC_PASSWORD", $null);
[Environment]::SetEnvironmentVariable("DRONE_NETRC_FILE", $null);
[Environment]::SetEnvironmentVariable("DRONE_SCRIPT", $null);
"#;

/// Entrypoint, command and script for a step that runs shell commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub script: String,
}

/// Build the script for the target os
pub fn generate(os: &str, commands: &[String]) -> Script {
    if os == "windows" {
        Script {
            entrypoint: vec![
                "powershell".to_string(),
                "-noprofile".to_string(),
                "-noninteractive".to_string(),
                "-command".to_string(),
            ],
            command: vec![format!("$Env:{} | iex", SCRIPT_VAR)],
            script: powershell(commands),
        }
    } else {
        Script {
            entrypoint: vec!["/bin/sh".to_string(), "-c".to_string()],
            command: vec![format!("echo \"${}\" | /bin/sh", SCRIPT_VAR)],
            script: posix(commands),
        }
    }
}

/// POSIX shell script that echoes each command before running it
pub fn posix(commands: &[String]) -> String {
    let mut buf = String::from(POSIX_PREAMBLE);
    for command in commands {
        buf.push('\n');
        buf.push_str(&format!("echo + {}\n", escape(Cow::Borrowed(command.as_str()))));
        buf.push_str(command);
        buf.push('\n');
    }
    buf
}

/// PowerShell script that echoes each command and stops on a failing exit code
pub fn powershell(commands: &[String]) -> String {
    let mut buf = String::from(POWERSHELL_PREAMBLE);
    for command in commands {
        buf.push('\n');
        buf.push_str(&format!("echo '+ {}'\n", command.replace('\'', "''")));
        buf.push_str(command);
        buf.push_str("\nif ($LastExitCode -gt 0) { exit $LastExitCode }\n");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_posix_script() {
        let script = generate("linux", &["go build".to_string(), "echo 'hi'".to_string()]);

        assert_eq!(script.entrypoint, vec!["/bin/sh", "-c"]);
        assert_eq!(script.command, vec!["echo \"$DRONE_SCRIPT\" | /bin/sh"]);
        assert!(script.script.contains("set -e\n"));
        assert!(script.script.contains("echo + 'go build'\ngo build\n"));
        assert!(script.script.contains("unset DRONE_NETRC_PASSWORD"));
    }

    #[test]
    fn test_powershell_script() {
        let script = generate("windows", &["dir 'c:\\'".to_string()]);

        assert_eq!(script.entrypoint[0], "powershell");
        assert_eq!(script.command, vec!["$Env:DRONE_SCRIPT | iex"]);
        assert!(script.script.contains("echo '+ dir ''c:\\'''"));
        assert!(script.script.contains("if ($LastExitCode -gt 0) { exit $LastExitCode }"));
    }
}
