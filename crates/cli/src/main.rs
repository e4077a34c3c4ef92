fn main() {
    if let Err(error) = djvu_reader_cli::run(std::env::args_os()) {
        eprintln!("{error:#}");
        std::process::exit(1);
    }
}
