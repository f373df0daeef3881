use jprog_hal::list_probes;

fn main() {
    let probes = list_probes().expect("USB enumeration failed");
    if probes.is_empty() {
        println!("no supported probes connected");
        return;
    }
    for (i, probe) in probes.iter().enumerate() {
        println!("{i}: {}", probe.describe());
    }
}
