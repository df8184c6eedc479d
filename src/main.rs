fn main() {
    std::process::exit(multicam_tally::run_cli());
}
