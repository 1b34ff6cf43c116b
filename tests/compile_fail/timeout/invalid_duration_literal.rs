use coalescer::utils::timer::timeout;

#[timeout("10h")]
async fn refresh() -> Result<u32, coalescer::utils::timer::TimeoutError> {
    Ok(1)
}

fn main() {}
