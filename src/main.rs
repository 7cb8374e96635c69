use std::error::Error;

use woff2_sfnt::decompress_woff2;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = std::env::args();
    let (Some(infile), Some(outfile)) = (args.nth(1), args.next()) else {
        eprintln!("usage: woff2-sfnt <in.woff2> <out.ttf>");
        std::process::exit(2);
    };

    log::info!("Reading from {infile}");
    let woff = std::fs::read(&infile)?;

    let sfnt = decompress_woff2(&woff)?;

    log::info!("Writing {} bytes to {outfile}", sfnt.len());
    std::fs::write(outfile, sfnt)?;

    Ok(())
}
