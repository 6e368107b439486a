mod application;
mod console;
mod interrupt;
mod logging;
mod options;
mod state;

use anyhow::Result;
use application::{and_cleanup, handle_result, runtime};
use clap::{CommandFactory as _, Parser, Subcommand};
use options::Options;
use state::StateCommand;

fn main() {
    let args = Args::parse();
    handle_result(run_args(args));
}

fn run_args(args: Args) -> Result<()> {
    match &args.command {
        Commands::State(sub) => {
            let interrupt_state = interrupt::set_up_process_interrupt_handler()?;
            let mut logger = logging::set_up(logging::Options {
                verbose: args.options.verbose,
                color: args.options.use_color(),
            })?;
            let result = runtime().block_on(state::run(&interrupt_state, &args.options, sub));
            and_cleanup(result, logger.tear_down())
        }
        Commands::GenerateMan => (|| {
            let cmd = Args::command();
            let man = clap_mangen::Man::new(cmd);
            let mut buffer: Vec<u8> = Default::default();
            man.render(&mut buffer)?;
            println!("{}", String::from_utf8(buffer)?);
            Ok(())
        })(),
        Commands::GenerateMarkdown => {
            let opts = clap_markdown::MarkdownOptions::new().show_footer(false);
            let markdown: String = clap_markdown::help_markdown_custom::<Args>(&opts);
            println!("{}", markdown);
            Ok(())
        }
        Commands::GenerateCompletion { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(*shell, &mut cmd, "orchestra", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Orchestra: inspect and edit deployment state
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    options: Options,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Commands that operate on the deployment state of an application
    #[command(subcommand)]
    State(StateCommand),

    /// Generate markdown documentation for orchestra
    #[command(hide = true)]
    GenerateMarkdown,

    /// Generate a manpage for orchestra
    #[command(hide = true)]
    GenerateMan,

    /// Generate shell completion for orchestra
    #[command(hide = true)]
    GenerateCompletion {
        /// The shell to generate completion for
        #[arg(long)]
        shell: clap_complete::Shell,
    },
}
