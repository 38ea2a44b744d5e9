use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use zeroize::Zeroizing;

use crate::crypto;
use crate::keydb::{KEYDB_VERSION, KeyDb, VOLUME_FLAG_ALLOW_DISCARDS, VolumeEntry};

pub struct EditorOpts {
    /// Database to open before the first prompt.
    pub filename: Option<PathBuf>,
}

struct EditorContext {
    keydb: Option<KeyDb>,
    filename: Option<PathBuf>,
    /// Session save passphrase: set on the first `save`, cleared by `new`.
    passphrase: Option<Zeroizing<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    TooFewParameters,
    TooManyParameters,
}

struct Command {
    names: &'static [&'static str],
    params: &'static str,
    min_params: usize,
    max_params: usize,
    description: &'static str,
    run: fn(&mut EditorContext, &[&str]) -> Outcome,
}

const COMMANDS: &[Command] = &[
    Command {
        names: &["help", "?"],
        params: "",
        min_params: 0,
        max_params: 0,
        description: "Shows a help page describing all available commands",
        run: cmd_help,
    },
    Command {
        names: &["new"],
        params: "",
        min_params: 0,
        max_params: 0,
        description: "Create a new database file",
        run: cmd_new,
    },
    Command {
        names: &["list", "l"],
        params: "",
        min_params: 0,
        max_params: 0,
        description: "List contents of database file",
        run: cmd_list,
    },
    Command {
        names: &["add_host"],
        params: "[hostname]",
        min_params: 1,
        max_params: 1,
        description: "Add a new host to the database file",
        run: cmd_add_host,
    },
    Command {
        names: &["del_host"],
        params: "[hostname]",
        min_params: 1,
        max_params: 1,
        description: "Removes a host from the database file",
        run: cmd_del_host,
    },
    Command {
        names: &["rekey_host"],
        params: "[hostname]",
        min_params: 1,
        max_params: 1,
        description: "Re-keys the TLS PSK of a given host",
        run: cmd_rekey_host,
    },
    Command {
        names: &["host_param"],
        params: "[hostname] timeout [value]",
        min_params: 3,
        max_params: 3,
        description: "Set a parameter of a host (currently only timeout supported)",
        run: cmd_host_param,
    },
    Command {
        names: &["add_volume"],
        params: "[hostname] [devmappername] [volume-UUID]",
        min_params: 3,
        max_params: 3,
        description: "Add a new volume to the hostname",
        run: cmd_add_volume,
    },
    Command {
        names: &["del_volume"],
        params: "[hostname] [devmappername]",
        min_params: 2,
        max_params: 2,
        description: "Removes a volume from the given host",
        run: cmd_del_volume,
    },
    Command {
        names: &["rekey_volume"],
        params: "[hostname] [devmappername]",
        min_params: 2,
        max_params: 2,
        description: "Re-keys the LUKS passphrase of a volume of a given hostname",
        run: cmd_rekey_volume,
    },
    Command {
        names: &["showkey_volume"],
        params: "[hostname] [devmappername]",
        min_params: 2,
        max_params: 2,
        description: "Shows the LUKS passphrase of a volume of a hostname",
        run: cmd_showkey_volume,
    },
    Command {
        names: &["flag_volume"],
        params: "[hostname] [devmappername] [(+-)(allow_discards)]",
        min_params: 3,
        max_params: 3,
        description: "Edits the flags of a volume",
        run: cmd_flag_volume,
    },
    Command {
        names: &["open", "load"],
        params: "[filename]",
        min_params: 1,
        max_params: 1,
        description: "Opens a database file",
        run: cmd_open,
    },
    Command {
        names: &["save"],
        params: "([filename])",
        min_params: 0,
        max_params: 1,
        description: "Saves a database file",
        run: cmd_save,
    },
    Command {
        names: &["export"],
        params: "[hostname] [filename]",
        min_params: 2,
        max_params: 2,
        description: "Export a host database file for a specific host",
        run: cmd_export,
    },
];

fn find_command(name: &str) -> Option<&'static Command> {
    COMMANDS
        .iter()
        .find(|cmd| cmd.names.iter().any(|n| n.eq_ignore_ascii_case(name)))
}

fn format_command(cmd: &Command, name: &str) -> String {
    if cmd.params.is_empty() {
        name.to_string()
    } else {
        format!("{name} {}", cmd.params)
    }
}

fn cmd_help(_ctx: &mut EditorContext, _params: &[&str]) -> Outcome {
    println!("List of commands:");
    for cmd in COMMANDS {
        let formatted = format_command(cmd, cmd.names[0]);
        if formatted.len() <= 40 {
            println!("    {formatted:<40} {}", cmd.description);
        } else {
            println!("    {formatted}\n    {:<40} {}", "", cmd.description);
        }
    }
    Outcome::Success
}

fn cmd_new(ctx: &mut EditorContext, _params: &[&str]) -> Outcome {
    ctx.keydb = Some(KeyDb::new());
    ctx.passphrase = None;
    Outcome::Success
}

fn cmd_list(ctx: &mut EditorContext, _params: &[&str]) -> Outcome {
    let Some(db) = &ctx.keydb else {
        println!("No key database loaded.");
        return Outcome::Failure;
    };
    println!(
        "Keydb version {KEYDB_VERSION}, {} database, {} hosts.",
        if db.server_database { "server" } else { "client" },
        db.hosts.len()
    );
    for (i, host) in db.hosts.iter().enumerate() {
        let timeout = if host.client_default_timeout_secs == 0 {
            "no default timeout".to_string()
        } else {
            format!("default timeout {} secs", host.client_default_timeout_secs)
        };
        println!(
            "    Host {}: \"{}\" UUID {} -- {} volumes, {timeout}:",
            i + 1,
            host.host_name,
            crypto::format_uuid(&host.host_uuid),
            host.volumes.len()
        );
        for (j, volume) in host.volumes.iter().enumerate() {
            let flags = if volume.volume_flags == 0 {
                "defaults"
            } else {
                "allow_discards"
            };
            println!(
                "        Volume {}: \"{}\" UUID {}   {flags}",
                j + 1,
                volume.devmapper_name,
                crypto::format_uuid(&volume.volume_uuid)
            );
        }
    }
    Outcome::Success
}

fn require_db<'a>(ctx: &'a mut EditorContext) -> Option<&'a mut KeyDb> {
    if ctx.keydb.is_none() {
        eprintln!("No key database loaded.");
    }
    ctx.keydb.as_mut()
}

fn cmd_add_host(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let db = ctx.keydb.get_or_insert_with(KeyDb::new);
    match db.add_host(params[0]) {
        Ok(_) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_del_host(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    match db.del_host_by_name(params[0]) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_rekey_host(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    match db.rekey_host(params[0]) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_host_param(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    if !params[1].eq_ignore_ascii_case("timeout") {
        eprintln!("Invalid parameter: {}", params[1]);
        return Outcome::Failure;
    }
    let Ok(secs) = params[2].parse::<u32>() else {
        eprintln!("Invalid timeout value: {}", params[2]);
        return Outcome::Failure;
    };
    match db.set_host_timeout(params[0], secs) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn print_volume_key(volume: &VolumeEntry) {
    let passphrase = volume.passphrase_text();
    println!(
        "LUKS passphrase of {} / {}: {}",
        volume.devmapper_name,
        crypto::format_uuid(&volume.volume_uuid),
        passphrase.as_str()
    );
}

fn cmd_add_volume(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    let Some(volume_uuid) = crypto::parse_uuid(params[2]) else {
        eprintln!("Not a valid UUID: {}", params[2]);
        return Outcome::Failure;
    };
    match db.add_volume(params[0], params[1], volume_uuid) {
        Ok(volume) => {
            print_volume_key(volume);
            Outcome::Success
        }
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_del_volume(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    match db.del_volume(params[0], params[1]) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_rekey_volume(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    match db.rekey_volume(params[0], params[1]) {
        Ok(volume) => {
            print_volume_key(volume);
            Outcome::Success
        }
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_showkey_volume(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    match db.get_volume(params[0], params[1]) {
        Ok(volume) => {
            print_volume_key(volume);
            Outcome::Success
        }
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_flag_volume(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    let flag_str = params[2];
    let Some(enable) = flag_str.strip_prefix('+').map(|_| true).or_else(|| flag_str.strip_prefix('-').map(|_| false)) else {
        eprintln!("Flag string must start with '+' or '-' for adding or removing a flag.");
        return Outcome::Failure;
    };
    let flag_name = &flag_str[1..];
    if !flag_name.eq_ignore_ascii_case("allow_discards") {
        eprintln!("Invalid flag '{flag_name}': allowed is only 'allow_discards'.");
        return Outcome::Failure;
    }
    match db.set_volume_flag(params[0], params[1], VOLUME_FLAG_ALLOW_DISCARDS, enable) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_open(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let filename = PathBuf::from(params[0]);
    let passphrase = match prompt_passphrase("Database passphrase: ") {
        Ok(passphrase) => passphrase,
        Err(err) => {
            eprintln!("Failed to read passphrase: {err}");
            return Outcome::Failure;
        }
    };
    match KeyDb::read(&filename, &passphrase) {
        Ok(db) => {
            ctx.keydb = Some(db);
            ctx.filename = Some(filename);
            Outcome::Success
        }
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_save(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    if ctx.keydb.is_none() {
        eprintln!("No key database loaded.");
        return Outcome::Failure;
    }
    if let Some(&filename) = params.first() {
        ctx.filename = Some(PathBuf::from(filename));
    }
    let Some(filename) = ctx.filename.clone() else {
        eprintln!("No filename given.");
        return Outcome::Failure;
    };

    if ctx.passphrase.is_none() {
        match prompt_passphrase("Database passphrase: ") {
            Ok(passphrase) => ctx.passphrase = Some(passphrase),
            Err(err) => {
                eprintln!("Failed to read passphrase: {err}");
                return Outcome::Failure;
            }
        }
    }

    let db = ctx.keydb.as_ref().expect("checked above");
    let passphrase = ctx.passphrase.as_ref().expect("just set");
    match db.write(&filename, passphrase) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("{err}");
            Outcome::Failure
        }
    }
}

fn cmd_export(ctx: &mut EditorContext, params: &[&str]) -> Outcome {
    let Some(db) = require_db(ctx) else {
        return Outcome::Failure;
    };
    let exported = match db.export_public(params[0]) {
        Ok(exported) => exported,
        Err(err) => {
            eprintln!("{err}");
            return Outcome::Failure;
        }
    };
    let passphrase = match prompt_passphrase("Client passphrase: ") {
        Ok(passphrase) => passphrase,
        Err(err) => {
            eprintln!("Failed to read export passphrase: {err}");
            return Outcome::Failure;
        }
    };
    match exported.write(Path::new(params[1]), &passphrase) {
        Ok(()) => Outcome::Success,
        Err(err) => {
            eprintln!("Failed to write exported database: {err}");
            Outcome::Failure
        }
    }
}

fn prompt_passphrase(prompt: &str) -> io::Result<Zeroizing<String>> {
    rpassword::prompt_password(prompt).map(Zeroizing::new)
}

fn execute(cmd: &Command, ctx: &mut EditorContext, tokens: &[&str]) -> Outcome {
    let params = &tokens[1..];
    if params.len() < cmd.min_params {
        Outcome::TooFewParameters
    } else if params.len() > cmd.max_params {
        Outcome::TooManyParameters
    } else {
        (cmd.run)(ctx, params)
    }
}

fn execute_tokens(ctx: &mut EditorContext, tokens: &[&str]) -> Outcome {
    match find_command(tokens[0]) {
        Some(cmd) => execute(cmd, ctx, tokens),
        None => Outcome::Failure,
    }
}

fn report_outcome(cmd: &Command, name: &str, outcome: Outcome) {
    match outcome {
        Outcome::Success => {}
        Outcome::Failure => println!("Execution failed: {name}"),
        Outcome::TooFewParameters | Outcome::TooManyParameters => {
            let formatted = format_command(cmd, name);
            if cmd.min_params == cmd.max_params {
                println!(
                    "Wrong number of parameters: \"{name}\" requires {} parameters -- {formatted}",
                    cmd.min_params
                );
            } else if outcome == Outcome::TooFewParameters {
                println!(
                    "Too few parameters: \"{name}\" requires at least {} parameters -- {formatted}",
                    cmd.min_params
                );
            } else {
                println!(
                    "Too many parameters: \"{name}\" requires at most {} parameters -- {formatted}",
                    cmd.max_params
                );
            }
        }
    }
}

/// Run the interactive database editor until EOF.
pub fn run(opts: EditorOpts) -> Result<()> {
    let mut ctx = EditorContext {
        keydb: None,
        filename: None,
        passphrase: None,
    };

    if let Some(filename) = &opts.filename {
        let name = filename.to_string_lossy().into_owned();
        if execute_tokens(&mut ctx, &["open", &name]) != Outcome::Success {
            anyhow::bail!("Failed to open database {name}");
        }
    }

    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            continue;
        }

        let Some(command) = find_command(tokens[0]) else {
            println!(
                "No such command: \"{}\" -- type \"help\" to get a list of valid commands",
                tokens[0]
            );
            continue;
        };
        let outcome = execute(command, &mut ctx, &tokens);
        report_outcome(command, tokens[0], outcome);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> EditorContext {
        EditorContext {
            keydb: None,
            filename: None,
            passphrase: None,
        }
    }

    #[test]
    fn test_find_command_aliases() {
        assert!(find_command("help").is_some());
        assert!(find_command("?").is_some());
        assert!(find_command("LIST").is_some());
        assert!(find_command("load").is_some());
        assert!(find_command("bogus").is_none());
    }

    #[test]
    fn test_parameter_count_checking() {
        let mut ctx = ctx();
        assert_eq!(
            execute_tokens(&mut ctx, &["add_host"]),
            Outcome::TooFewParameters
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["add_host", "a", "b"]),
            Outcome::TooManyParameters
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["save", "a", "b"]),
            Outcome::TooManyParameters
        );
    }

    #[test]
    fn test_add_host_creates_database() {
        let mut ctx = ctx();
        assert_eq!(
            execute_tokens(&mut ctx, &["add_host", "alpha"]),
            Outcome::Success
        );
        let db = ctx.keydb.as_ref().unwrap();
        assert!(db.server_database);
        assert_eq!(db.hosts.len(), 1);
        assert_eq!(db.hosts[0].host_name, "alpha");
    }

    #[test]
    fn test_host_and_volume_lifecycle() {
        let mut ctx = ctx();
        execute_tokens(&mut ctx, &["add_host", "alpha"]);
        assert_eq!(
            execute_tokens(
                &mut ctx,
                &[
                    "add_volume",
                    "alpha",
                    "crypt-root",
                    "550e8400-e29b-41d4-a716-446655440000"
                ]
            ),
            Outcome::Success
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["flag_volume", "alpha", "crypt-root", "+allow_discards"]),
            Outcome::Success
        );
        {
            let db = ctx.keydb.as_ref().unwrap();
            assert!(db.hosts[0].volumes[0].allow_discards());
        }
        assert_eq!(
            execute_tokens(&mut ctx, &["flag_volume", "alpha", "crypt-root", "-allow_discards"]),
            Outcome::Success
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["host_param", "alpha", "timeout", "120"]),
            Outcome::Success
        );
        {
            let db = ctx.keydb.as_ref().unwrap();
            assert!(!db.hosts[0].volumes[0].allow_discards());
            assert_eq!(db.hosts[0].client_default_timeout_secs, 120);
        }
        assert_eq!(
            execute_tokens(&mut ctx, &["del_volume", "alpha", "crypt-root"]),
            Outcome::Success
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["del_host", "alpha"]),
            Outcome::Success
        );
        assert!(ctx.keydb.as_ref().unwrap().hosts.is_empty());
    }

    #[test]
    fn test_rejects_bad_input() {
        let mut ctx = ctx();
        execute_tokens(&mut ctx, &["add_host", "alpha"]);
        assert_eq!(
            execute_tokens(&mut ctx, &["add_volume", "alpha", "crypt-root", "not-a-uuid"]),
            Outcome::Failure
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["host_param", "alpha", "color", "blue"]),
            Outcome::Failure
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["host_param", "alpha", "timeout", "soon"]),
            Outcome::Failure
        );
        assert_eq!(
            execute_tokens(
                &mut ctx,
                &["flag_volume", "alpha", "missing", "allow_discards"]
            ),
            Outcome::Failure
        );
        assert_eq!(
            execute_tokens(&mut ctx, &["del_host", "beta"]),
            Outcome::Failure
        );
    }

    #[test]
    fn test_new_resets_session() {
        let mut ctx = ctx();
        execute_tokens(&mut ctx, &["add_host", "alpha"]);
        ctx.passphrase = Some(Zeroizing::new("secret".to_string()));
        assert_eq!(execute_tokens(&mut ctx, &["new"]), Outcome::Success);
        assert!(ctx.keydb.as_ref().unwrap().hosts.is_empty());
        assert!(ctx.passphrase.is_none());
    }

    #[test]
    fn test_commands_requiring_database() {
        let mut ctx = ctx();
        for tokens in [
            ["list"].as_slice(),
            &["del_host", "alpha"],
            &["rekey_host", "alpha"],
            &["showkey_volume", "alpha", "crypt-root"],
        ] {
            assert_eq!(execute_tokens(&mut ctx, tokens), Outcome::Failure);
        }
    }
}
