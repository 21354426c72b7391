use rpoe::error::{RpoeError, ValidationError};
use rpoe::exit_codes;
use std::process;

fn main() {
    match rpoe::cli::run() {
        Ok(code) => process::exit(code),
        Err(e) => {
            let rpoe_error = e.downcast_ref::<RpoeError>();
            if let Some(RpoeError::Validation(ValidationError::HelpRequested(help))) = rpoe_error {
                print!("{}", help);
                process::exit(exit_codes::OK);
            }
            eprintln!("Error: {:#}", e);
            process::exit(rpoe_error.map_or(exit_codes::FAILED, RpoeError::exit_code));
        }
    }
}
