use std::env;
use std::path::PathBuf;

pub const HOME_ENV: &str = "ARCHIVE_WRITER_HOME";

fn fallback_dotenv_path(writer_home: Option<PathBuf>, home_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(base) = writer_home {
        return Some(base.join(".env"));
    }
    Some(home_dir?.join(".archive_writer/.env"))
}

/// `.env` in the working directory wins; otherwise the writer home's `.env`.
/// Variables already set in the process are never overwritten.
pub fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    let fallback = fallback_dotenv_path(env::var_os(HOME_ENV).map(PathBuf::from), dirs::home_dir());

    let Some(path) = fallback else {
        return;
    };
    if path.is_file() {
        let _ = dotenvy::from_path(&path);
    }
}
