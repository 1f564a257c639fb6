pub mod fetch;
pub mod msg;
pub mod state;
pub mod svc;

// conversation surface text, kept in one place so the replies stay
// consistent between the upload and url paths
pub const HELP_TEXT: &str = "send me a file to archive it and get a stream link.\n\
send a video url to fetch it remotely.\n\n\
/list [page] -- your archived files\n\
/search <text> -- find files by name\n\
/del <id> -- remove a file from the index\n\
/help -- this message";

pub const NAME_PROMPT: &str = "reply with a display name for this file, or /skip to keep";

pub const SKIP_TOKEN: &str = "/skip";
