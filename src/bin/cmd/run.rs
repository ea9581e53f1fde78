use clap::{Args, ValueEnum};
use guestcall::{ArchState, Capabilities, ExecutableFormat, Sandbox};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Format {
    Auto,
    Flat,
    Elf64,
}

impl From<Format> for ExecutableFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Auto => Self::Auto,
            Format::Flat => Self::Flat,
            Format::Elf64 => Self::Elf64,
        }
    }
}

#[derive(Args)]
pub struct Cmd {
    /// Executable to run in the sandbox.
    #[arg(short, long)]
    pub filepath: String,

    #[arg(long, value_enum, default_value = "auto")]
    pub format: Format,
}

impl Cmd {
    pub fn execute(&self) -> guestcall::Result<()> {
        let mut sandbox = Sandbox::new(Capabilities::empty())?;
        sandbox.load_executable(&self.filepath, self.format.into())?;

        let mut state = ArchState::default();
        sandbox.call(&mut state)?;

        println!("rax = {:#x}", state.rax);
        Ok(())
    }
}
