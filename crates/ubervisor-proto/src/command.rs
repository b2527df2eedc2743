/// The closed set of request mnemonics. Every request payload starts with
/// one of these as four ASCII bytes, followed by a JSON body (possibly
/// empty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Dele,
    Dump,
    Exit,
    Getc,
    Helo,
    Kill,
    List,
    Pids,
    Read,
    Spwn,
    Subs,
    Updt,
}

/// Sorted by mnemonic so lookup can binary-search.
const COMMANDS: [(&[u8; 4], Command); 12] = [
    (b"DELE", Command::Dele),
    (b"DUMP", Command::Dump),
    (b"EXIT", Command::Exit),
    (b"GETC", Command::Getc),
    (b"HELO", Command::Helo),
    (b"KILL", Command::Kill),
    (b"LIST", Command::List),
    (b"PIDS", Command::Pids),
    (b"READ", Command::Read),
    (b"SPWN", Command::Spwn),
    (b"SUBS", Command::Subs),
    (b"UPDT", Command::Updt),
];

impl Command {
    /// Look up the command named by the first four bytes of a payload.
    pub fn parse(payload: &[u8]) -> Option<Command> {
        if payload.len() < 4 {
            return None;
        }
        let head: &[u8] = &payload[..4];
        COMMANDS
            .binary_search_by(|(name, _)| name.as_slice().cmp(head))
            .ok()
            .map(|i| COMMANDS[i].1)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Command::Dele => "DELE",
            Command::Dump => "DUMP",
            Command::Exit => "EXIT",
            Command::Getc => "GETC",
            Command::Helo => "HELO",
            Command::Kill => "KILL",
            Command::List => "LIST",
            Command::Pids => "PIDS",
            Command::Read => "READ",
            Command::Spwn => "SPWN",
            Command::Subs => "SUBS",
            Command::Updt => "UPDT",
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.mnemonic())
    }
}
