//! Versioned security rule tables
//!
//! Every list the validator and risk classifier consult lives here so the
//! policy can be reviewed in one place and extended without touching control
//! flow. Bump [`RULES_VERSION`] whenever a table changes.

/// Version of the built-in rule tables, reported by `status`.
pub const RULES_VERSION: &str = "2026.10.1";

/// Named regex rule.
pub struct PatternDef {
    pub name: &'static str,
    pub pattern: &'static str,
    pub description: &'static str,
}

/// Substrings that reject a command outright.
///
/// Matched case-insensitively against the command with whitespace runs
/// collapsed to a single space.
pub const FORBIDDEN_LITERALS: &[&str] = &[
    // Recursive delete of the filesystem or home
    "rm -rf /",
    "rm -fr /",
    "rm -r -f /",
    "rm -rf ~",
    "rm -fr ~",
    "rm -rf --no-preserve-root",
    // Raw disk writes
    "dd if=/dev/zero of=/dev/",
    "dd if=/dev/random of=/dev/",
    "dd if=/dev/urandom of=/dev/",
    "> /dev/sda",
    "of=/dev/sda",
    "of=/dev/nvme",
    "/dev/mem",
    "/dev/kmem",
    // Filesystem formatting
    "mkfs",
    "wipefs",
    "mkswap /dev/",
    // Fork bomb
    ":(){ :|:& };:",
    ":(){:|:&};:",
    // Recursive permission changes on root
    "chmod -r 777 /",
    "chmod -r 000 /",
    "chmod 777 / ",
    "chown -r root /",
    // Wiping crontab and shell history
    "crontab -r",
    "history -c",
    "mv / ",
];

/// Dangerous command families.
pub const DANGEROUS_PATTERNS: &[PatternDef] = &[
    PatternDef {
        name: "recursive_delete_root",
        pattern: r"(?i)\brm\s+(?:-\S+\s+)*-\S*[rR]\S*\s+(?:-\S+\s+)*(?:/|~/?|\$HOME/?|\*|/\*|/(?:bin|boot|dev|etc|home|lib|lib64|opt|proc|root|sbin|srv|sys|usr|var)/?)(?:\s|$)",
        description: "Recursive delete of a root-like path",
    },
    PatternDef {
        name: "block_device_write",
        pattern: r"(?i)(?:>|\bof=)\s*/dev/(?:sd[a-z]|hd[a-z]|vd[a-z]|xvd[a-z]|nvme\d|mmcblk\d|disk\d|md\d|dm-\d|loop\d)",
        description: "Direct write to a block device",
    },
    PatternDef {
        name: "filesystem_format",
        pattern: r"(?i)\b(?:mkfs(?:\.\w+)?|mke2fs|mkswap|wipefs)\b",
        description: "Filesystem creation or signature wipe",
    },
    PatternDef {
        name: "secure_erase",
        pattern: r"(?i)\bshred\b.*\s/dev/",
        description: "Overwriting a device with shred",
    },
    PatternDef {
        name: "kill_all_processes",
        pattern: r"(?i)\bkill\s+(?:-\S+\s+)*-?1(?:\s|$)",
        description: "Signal to every process or to init",
    },
    PatternDef {
        name: "mass_process_kill",
        pattern: r"(?i)\b(?:killall5?|pkill)\b",
        description: "Killing processes by name",
    },
    PatternDef {
        name: "system_power",
        pattern: r"(?i)\b(?:shutdown|reboot|halt|poweroff)\b|\binit\s+[06]\b|\bsystemctl\s+(?:poweroff|reboot|halt|suspend|hibernate|kexec)\b",
        description: "System shutdown, reboot or halt",
    },
    PatternDef {
        name: "remote_script_exec",
        pattern: r"(?i)\b(?:curl|wget|fetch)\b[^|]*\|\s*(?:sudo\s+)?(?:(?:ba|z|k|da|fi|c|tc)?sh|python[23]?|perl|ruby|node)\b",
        description: "Downloaded content piped into an interpreter",
    },
    PatternDef {
        name: "recursive_permission_root",
        pattern: r"(?i)\bch(?:mod|own|grp)\b.*\s-\S*[rR]\S*\s.*\s/(?:\*|\s|$)",
        description: "Recursive ownership or mode change on /",
    },
    PatternDef {
        name: "bare_redirect",
        pattern: r"^\s*>",
        description: "Redirection with no command truncates the target",
    },
    PatternDef {
        name: "fork_bomb",
        pattern: r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;?\s*:",
        description: "Self-replicating shell function",
    },
    PatternDef {
        name: "discard_to_null",
        pattern: r"(?i)\bmv\b.*\s/dev/null(?:\s|$)",
        description: "Moving files into /dev/null destroys them",
    },
];

/// Chaining idioms accepted despite `&&`.
///
/// `;` and `||` have no safe form and are always rejected.
pub const SAFE_CHAIN_PATTERNS: &[PatternDef] = &[
    PatternDef {
        name: "confirm_with_echo",
        pattern: r"^[^;&|]+&&\s*echo\b[^;&|]*$",
        description: "cmd && echo ...",
    },
    PatternDef {
        name: "guarded_by_test",
        pattern: r"^\s*(?:test\s|\[\s)[^;&|]*&&[^;&|]+$",
        description: "test ... && cmd",
    },
];

/// Environment variables that may be exported or unset.
pub const SAFE_ENV_VARS: &[&str] = &[
    "EDITOR",
    "VISUAL",
    "PAGER",
    "LESS",
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "TZ",
    "TERM",
    "COLUMNS",
    "LINES",
    "HISTSIZE",
    "GREP_COLOR",
    "GREP_COLORS",
    "CLICOLOR",
    "NO_COLOR",
];

/// Variables whose assignment alters how every program is loaded or found.
pub const LOADER_ENV_VARS: &[&str] = &["LD_PRELOAD", "LD_LIBRARY_PATH", "LD_AUDIT", "PATH"];

/// Redirection into any of these trees is rejected.
pub const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/dev", "/lib", "/lib64", "/proc", "/sys",
    "/root", "/var/log",
];

/// Device sinks that remain writable.
pub const SAFE_DEVICE_SINKS: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty"];

/// Commands permitted in restricted mode (matched on the basename of the
/// first word).
pub const RESTRICTED_COMMANDS: &[&str] = &[
    "ls", "ll", "la", "tree", "pwd", "cat", "head", "tail", "less", "more", "grep", "egrep",
    "fgrep", "rg", "ag", "find", "locate", "which", "whereis", "type", "file", "stat", "wc", "du",
    "df", "echo", "printf", "date", "cal", "whoami", "id", "groups", "uname", "hostname",
    "uptime", "ps", "free", "printenv", "sort", "uniq", "cut", "tr", "diff", "cmp", "comm",
    "basename", "dirname", "realpath", "readlink", "md5sum", "sha1sum", "sha256sum", "nl",
    "column", "man", "whatis",
];

/// `find` actions that modify or execute.
pub const FIND_MUTATING_ACTIONS: &[&str] = &[
    "-exec", "-execdir", "-ok", "-okdir", "-delete", "-fprint", "-fprint0", "-fprintf", "-fls",
];

/// Destructive command verbs.
pub const HIGH_RISK_VERBS: &[&str] = &[
    "rm", "rmdir", "shred", "unlink", "dd", "mkfs", "wipefs", "fdisk", "parted", "kill",
    "killall", "pkill", "chmod", "chown", "chgrp", "truncate", "userdel", "groupdel",
];

/// Mutating but non-destructive command verbs.
pub const MEDIUM_RISK_VERBS: &[&str] = &[
    "mv", "cp", "mkdir", "touch", "ln", "install", "rsync", "scp", "tar", "unzip", "tee",
    "apt", "apt-get", "yum", "dnf", "pacman", "zypper", "brew", "pip", "pip3", "npm", "yarn",
    "cargo", "gem", "snap", "flatpak", "systemctl", "service", "useradd", "groupadd", "git",
];
