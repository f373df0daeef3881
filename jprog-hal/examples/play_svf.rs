use jprog_hal::{open_probe, CancelToken, Reporter, TapEngine};

fn main() {
    let path = std::env::args().nth(1).expect("usage: play_svf <file.svf>");
    let source = std::fs::read_to_string(&path).expect("readable SVF file");

    let mut tap = TapEngine::new(open_probe(0).expect("no probe"));
    let mut reporter = Reporter::new()
        .on_log(|level, msg| eprintln!("{level:?}: {msg}"))
        .on_progress(|pct| eprint!("\r{pct:3}%"));
    let cancel = CancelToken::new();

    jprog_hal::svf::play(&mut tap, &source, &mut reporter, &cancel).expect("playback failed");
    eprintln!();
}
