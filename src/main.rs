fn main() -> anyhow::Result<()> {
    address_geocoder_lib::run()
}
