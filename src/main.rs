fn main() {
    dashcam_lib::run()
}
