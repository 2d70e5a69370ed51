// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (c) 2024 Takashi Sakamoto

use {
    super::*,
    clap::Parser,
    glib::{Error, FileError},
};

pub trait ServiceCmd<A, T, R>: Sized
where
    A: Parser,
    R: RuntimeOperation<T>,
{
    fn params(args: &A) -> (T, Option<LogLevel>);

    /// Describe an error in terms of the subsystem it came from. The
    /// default covers Linux file operation failures; implementations extend
    /// it with their own error domains and fall back to
    /// [`file_err_to_string`].
    fn err_to_string(e: &Error) -> String {
        file_err_to_string(e)
    }

    fn run() {
        // NOTE: clap(v3.2.20)::Parser::parse() can exit process with 2 when detecting any error
        // or printing help.
        let args = A::parse();
        let (params, log_level) = Self::params(&args);

        let code = R::new(params, log_level)
            .and_then(|mut runtime| {
                runtime.listen()?;
                runtime.run()?;
                Ok(libc::EXIT_SUCCESS)
            })
            .map_err(|err| Self::err_to_string(&err))
            .unwrap_or_else(|msg| {
                eprintln!("{}", msg);
                libc::EXIT_FAILURE
            });

        std::process::exit(code)
    }
}

pub fn file_err_to_string(e: &Error) -> String {
    let (domain, cause) = if let Some(error) = e.kind::<FileError>() {
        (
            "Linux file operation error",
            match error {
                FileError::Acces => "Access permission",
                FileError::Isdir => "Is directory",
                FileError::Noent => "Not exists",
                FileError::Io => "I/O failure",
                _ => "",
            },
        )
    } else {
        ("Unknown domain error", "")
    };
    format!("{}: {}, {}", domain, cause, e)
}
