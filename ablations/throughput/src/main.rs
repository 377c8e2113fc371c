//! 单线程与多线程批量生产者的吞吐量比较.

mod profile;
mod result;
mod runner;

fn main() {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()
        .expect("Logger initialization error");

    runner::run().analyze();
}
