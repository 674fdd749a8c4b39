use std::fs;
use std::thread;

// Usage: spawn-threads PATH COUNT
//
// Reads PATH from COUNT threads at once, then prints how many reads succeeded.
fn main() {
    let mut args = std::env::args().skip(1);
    let path = args.next().unwrap_or_default();
    let count: usize = args.next().and_then(|n| n.parse().ok()).unwrap_or(4);

    let threads: Vec<_> = (0..count)
        .map(|_| {
            let path = path.clone();
            thread::spawn(move || fs::read(path).is_ok())
        })
        .collect();

    let ok = threads
        .into_iter()
        .map(|t| t.join().unwrap_or(false))
        .filter(|&ok| ok)
        .count();

    println!("{}", ok);
}
