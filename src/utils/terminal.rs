//! Passphrase prompt with echo disabled

use std::io::{self, BufRead, Write};
use termios::{tcsetattr, Termios, ECHO, TCSANOW};

/// RAII guard that turns off character echo on stdin and restores the
/// original settings on drop
pub struct NoEchoGuard {
	fd: i32,
	original: Termios,
}

impl NoEchoGuard {
	/// Returns None if stdin is not a terminal
	pub fn new() -> Option<Self> {
		let fd = 0; // stdin
		let original = Termios::from_fd(fd).ok()?;
		let mut quiet = original;
		quiet.c_lflag &= !ECHO;
		if tcsetattr(fd, TCSANOW, &quiet).is_err() {
			return None;
		}
		Some(NoEchoGuard { fd, original })
	}
}

impl Drop for NoEchoGuard {
	fn drop(&mut self) {
		let _ = tcsetattr(self.fd, TCSANOW, &self.original);
	}
}

/// Print `prompt` to stderr and read one line from stdin without echoing it.
/// Works without a terminal too (input piped in), just with echo.
pub fn prompt_passphrase(prompt: &str) -> io::Result<String> {
	let mut stderr = io::stderr();
	write!(stderr, "{}", prompt)?;
	stderr.flush()?;

	let line = {
		let _guard = NoEchoGuard::new();
		read_line(&mut io::stdin().lock())?
	};
	writeln!(stderr)?;
	Ok(line)
}

fn read_line(input: &mut dyn BufRead) -> io::Result<String> {
	let mut line = String::new();
	input.read_line(&mut line)?;
	Ok(line.trim_end_matches(&['\r', '\n'][..]).to_string())
}


// vim: ts=4
